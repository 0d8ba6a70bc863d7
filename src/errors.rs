// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Contains all the errors that can be returned by the library.

use custom_error::custom_error;

pub type VoiceResult<T> = std::result::Result<T, VoiceError>;

custom_error! {
    /// Errors on the voice signalling (control) WebSocket.
    ///
    /// See <https://discord.com/developers/docs/topics/opcodes-and-status-codes#voice-voice-close-event-codes>
    #[derive(Clone, Default, PartialEq, Eq)]
    pub SignallingError
    #[default]
    UnknownOpcode = "Sent or received an invalid opcode",
    FailedToDecodePayload = "Payload could not be decoded",
    NotAuthenticated = "Sent a payload before identifying",
    AuthenticationFailed = "The token sent in the identify payload is incorrect",
    AlreadyAuthenticated = "Sent more than one identify payload",
    SessionNoLongerValid = "The session is no longer valid",
    SessionTimeout = "The session timed out",
    ServerNotFound = "Could not find the server being connected to",
    UnknownProtocol = "The server did not recognise the selected protocol",
    Disconnected = "Channel was deleted, client was kicked, voice server changed, or the main gateway session was dropped",
    VoiceServerCrashed = "The voice server crashed",
    UnknownEncryptionMode = "The server failed to decrypt the selected encryption mode",
    CannotConnect{error: String} = "Cannot connect to the voice signalling server: {error}",
    NonHelloOnInitiate{opcode: u8} = "Received a non-Hello opcode ({opcode}) as the first message",
    UnexpectedOpcode{opcode: u8, state: &'static str} = "Received opcode {opcode}, which is not valid in state {state}",
    HeartbeatAckTimeout = "Did not receive a HeartbeatAck for two consecutive intervals",
    ResumeFailed = "Resume was rejected by the server",
}

/// The set of voice close codes after which the session cannot be resumed.
pub const NON_RESUMABLE_CLOSE_CODES: [u16; 3] = [4004, 4014, 4016];

impl From<u16> for SignallingError {
    fn from(close_code: u16) -> Self {
        match close_code {
            4001 => SignallingError::UnknownOpcode,
            4002 => SignallingError::FailedToDecodePayload,
            4003 => SignallingError::NotAuthenticated,
            4004 => SignallingError::AuthenticationFailed,
            4005 => SignallingError::AlreadyAuthenticated,
            4006 => SignallingError::SessionNoLongerValid,
            4009 => SignallingError::SessionTimeout,
            4011 => SignallingError::ServerNotFound,
            4012 => SignallingError::UnknownProtocol,
            4014 => SignallingError::Disconnected,
            4015 => SignallingError::VoiceServerCrashed,
            4016 => SignallingError::UnknownEncryptionMode,
            _ => SignallingError::default(),
        }
    }
}

custom_error! {
    /// Errors from the UDP transport: RTP/AEAD/IP-discovery I/O.
    #[derive(Clone, PartialEq, Eq)]
    pub TransportError
    BrokenSocket{error: String} = "Could not write to / read from the UDP socket: {error}",
    NoKey = "Tried to seal/open an RTP payload, but no session key has been received yet",
    NoSsrc = "Tried to send audio, but no SSRC has been assigned yet",
    PacketTooShort{len: usize, minimum: usize} = "Received a datagram of {len} bytes, shorter than the minimum of {minimum}",
    DecryptFailed = "AEAD authentication failed on an RTP packet; the packet was dropped",
    ConsecutiveDecryptFailures{count: u32} = "{count} consecutive AEAD failures at the head of a newly keyed stream; resetting the session",
    NonceCounterExhausted = "The 32-bit transport nonce counter would wrap; a key rotation is required before sending further packets",
    IpDiscoveryTimedOut{attempts: u8} = "IP discovery did not receive a response after {attempts} attempts",
    IpDiscoveryMalformed = "The IP discovery response could not be parsed",
}

custom_error! {
    /// Errors from the DAVE E2EE overlay: MLS adapter, frame codec, state machine.
    #[derive(Clone, PartialEq, Eq)]
    pub DaveError
    FrameTooShort{len: usize} = "DAVE frame is {len} bytes, shorter than the 11-byte minimum",
    BadMagicMarker = "The trailing 2 bytes of the frame are not the 0xFAFA magic marker",
    MalformedUleb128 = "Could not decode the ULEB128-encoded nonce",
    Uleb128TooLong = "ULEB128 value would require more than 5 bytes",
    NoFrameKey{user_id: u64, ssrc: u32, generation: u8} = "No frame key cached for user {user_id}, ssrc {ssrc}, generation {generation}",
    FrameDecryptFailed = "AEAD authentication failed on a DAVE frame",
    UnknownTransitionId{id: u64} = "ExecuteTransition referenced unknown transition {id}",
    InvalidCommitOrWelcome{error: String} = "Could not process MLS commit/welcome: {error}",
    NoActiveGroup = "No MLS group is active; cannot derive an exporter secret",
    OutOfOrderExecute = "ExecuteTransition arrived before its matching Welcome/Commit",
}

custom_error! {
    /// Errors from the Opus packetisation pipeline.
    #[derive(Clone, PartialEq, Eq)]
    pub OpusError
    WrongFrameSize{got: usize, expected: usize} = "PCM frame has {got} samples, expected {expected} (20ms @ 48kHz stereo)",
    EncodeFailed{error: String} = "Opus encode failed: {error}",
    DecodeFailed{error: String} = "Opus decode failed: {error}",
    NoDecoderForSsrc{ssrc: u32} = "No decoder state exists yet for ssrc {ssrc}",
}

custom_error! {
    /// Top-level error type returned by [`crate::Session`] operations.
    #[derive(Clone, PartialEq, Eq)]
    pub VoiceError
    Signalling{source: SignallingError} = "Signalling error: {source}",
    Transport{source: TransportError} = "Transport error: {source}",
    Dave{source: DaveError} = "DAVE error: {source}",
    Opus{source: OpusError} = "Opus error: {source}",
    Fatal{reason: String} = "Fatal session error: {reason}",
}

impl From<SignallingError> for VoiceError {
    fn from(source: SignallingError) -> Self {
        VoiceError::Signalling { source }
    }
}

impl From<TransportError> for VoiceError {
    fn from(source: TransportError) -> Self {
        VoiceError::Transport { source }
    }
}

impl From<DaveError> for VoiceError {
    fn from(source: DaveError) -> Self {
        VoiceError::Dave { source }
    }
}

impl From<OpusError> for VoiceError {
    fn from(source: OpusError) -> Self {
        VoiceError::Opus { source }
    }
}
