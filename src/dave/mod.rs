// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The DAVE end-to-end encryption overlay: MLS-derived per-frame keys layered beneath
//! the transport cipher.

pub mod control;
pub mod frame;
pub mod key_schedule;
pub mod mls;
pub mod state;
pub mod uleb128;

pub use control::ControlFrame;
pub use frame::{DaveNonce, DecodedFrame, FrameKey};
pub use key_schedule::KeySchedule;
pub use mls::{EpochSecret, GroupState, GroupStore};
pub use state::{DaveStateKind, DaveStateMachine};
