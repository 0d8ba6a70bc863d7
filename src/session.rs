// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The single-writer-per-session orchestration task (spec §5): owns the signalling
//! handle, UDP handle, transport cipher, Opus codec, and DAVE state machine, and is
//! the only place any of them is ever mutated.
//!
//! Grounded in `src/voice/handler.rs`'s `VoiceHandler`, which wires a voice gateway
//! connection, a UDP connection, and shared session data together behind one
//! `Observer`-driven task. This core replaces that struct's `Arc<RwLock<VoiceData>>`
//! with a message-loop task and a bridged event channel (`SessionSignal`), since
//! nothing outside the task is ever allowed to write to the state those observers
//! used to mutate directly; `src/gateway/observers.rs`'s generic, `Clone`-bounded
//! `Subscriber<T>` adapters are the model for [`SignalForward`] below.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use discortp::rtcp::Rtcp;
use log::*;
use pubserve::{Publisher, Subscriber};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::Instant;

use crate::dave::mls::GroupStore;
use crate::dave::{self, ControlFrame, DaveStateMachine, KeySchedule};
use crate::errors::{OpusError, SignallingError, TransportError, VoiceError, VoiceResult, NON_RESUMABLE_CLOSE_CODES};
use crate::opus::{Decoder, DecoderPool, Encoder, SilenceFlush};
use crate::signalling::events::SignallingEvents;
use crate::signalling::gateway::SignallingGateway;
use crate::signalling::handle::SignallingHandle;
use crate::signalling::messages::{ClientDisconnect, Ready, Resumed, SessionDescription, Speaking, SpeakingFlags};
use crate::signalling::state::SessionIdentity;
use crate::transport::{DecodedRtpPacket, TransportCipher, UdpEvents, UdpHandle};

/// Connection and recovery tunables (grounded in `src/gateway/options.rs`'s
/// `GatewayOptions`). Every field here is left implicit in spec.md and made explicit
/// as ambient configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bound on the signalling WebSocket handshake, from dial to Ready (spec §5, §7).
    pub handshake_timeout: Duration,
    /// Delays tried in order on a resumable disconnect before giving up on that
    /// attempt and trying again (spec §7: "100ms/400ms/1.6s, capped thereafter").
    pub reconnect_backoff: Vec<Duration>,
    /// The backoff ceiling once `reconnect_backoff` is exhausted (spec §7: 30s cap).
    pub max_reconnect_backoff: Duration,
    /// Whether a resumable close is followed by an automatic reconnect/resume at
    /// all. When `false`, any close simply ends the session (spec §7).
    pub auto_recovery: bool,
    /// How many consecutive DAVE frame-decrypt failures are tolerated before the
    /// session gives up and surfaces a fatal error, narrowing spec §9's Open
    /// Question about the decrypt-failure grace policy to a frame count the caller
    /// can tune. `None` means no grace: the first failure is fatal.
    pub dave_grace_window_frames: Option<u32>,
    /// Capacity of the bridged signal channel between the signalling/UDP event
    /// publishers and this session's message loop (spec §4.A buffer-pool sizing,
    /// generalised to the event-bridge queue).
    pub signal_channel_capacity: usize,
    /// `max_dave_protocol_version` to offer in Identify/Resume; `None` disables DAVE
    /// negotiation entirely.
    pub max_dave_protocol_version: Option<u16>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            reconnect_backoff: vec![Duration::from_millis(100), Duration::from_millis(400), Duration::from_millis(1600)],
            max_reconnect_backoff: Duration::from_secs(30),
            auto_recovery: true,
            dave_grace_window_frames: Some(50),
            signal_channel_capacity: 64,
            max_dave_protocol_version: None,
        }
    }
}

impl SessionOptions {
    fn backoff_delay(&self, attempt: usize) -> Duration {
        self.reconnect_backoff
            .get(attempt)
            .copied()
            .unwrap_or(self.max_reconnect_backoff)
            .min(self.max_reconnect_backoff)
    }
}

/// Paces audio egress at a 20ms cadence (spec §4.K). On a clock slew the scheduler
/// catches up without bursting more than two frames back-to-back, and then
/// resynchronises rather than letting the backlog grow unbounded.
///
/// Exposed as a pure `due_frames(now)` function of an explicit [`Instant`] so it can
/// be tested without a paused clock (this crate's dev-dependency `tokio` carries no
/// `test-util` feature).
struct AudioPacer {
    period: Duration,
    next_due: Instant,
}

impl AudioPacer {
    fn new(now: Instant) -> Self {
        let period = Duration::from_millis(20);
        Self { period, next_due: now + period }
    }

    /// How many frames are due as of `now` (capped at 2), advancing the schedule.
    fn due_frames(&mut self, now: Instant) -> u32 {
        let mut due = 0;
        while now >= self.next_due && due < 2 {
            self.next_due += self.period;
            due += 1;
        }
        if now >= self.next_due {
            // Still behind after the cap: resynchronise instead of accumulating an
            // ever-growing backlog of skipped ticks.
            self.next_due = now + self.period;
        }
        due
    }

    async fn tick(&mut self) -> u32 {
        tokio::time::sleep_until(self.next_due).await;
        self.due_frames(Instant::now())
    }
}

/// Bridges one published event type into [`SessionSignal`]s on a single channel, the
/// same generic `Clone`-bounded adapter shape as `src/gateway/observers.rs`'s
/// `BroadcastEventObserver<T>`.
struct SignalForward<T> {
    tx: mpsc::Sender<SessionSignal>,
    wrap: fn(T) -> SessionSignal,
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Subscriber<T> for SignalForward<T> {
    async fn update(&self, data: &T) {
        let _ = self.tx.send((self.wrap)(data.clone())).await;
    }
}

fn resumed_signal(_: Resumed) -> SessionSignal {
    SessionSignal::Resumed
}

/// RTCP reports are passthrough-only (spec §3 "Non-goals"): `discortp::rtcp::Rtcp`
/// isn't threaded onto the bridged signal channel at all, so nothing here needs it
/// to be `Clone`.
struct RtcpPassthrough;

#[async_trait]
impl Subscriber<Rtcp> for RtcpPassthrough {
    async fn update(&self, _data: &Rtcp) {
        trace!("SESSION: received RTCP report");
    }
}

async fn subscribe_signalling_events(events: &Arc<Mutex<SignallingEvents>>, tx: &mpsc::Sender<SessionSignal>) {
    let events = events.lock().await;
    events.ready.subscribe(Arc::new(SignalForward { tx: tx.clone(), wrap: SessionSignal::Ready }));
    events
        .session_description
        .subscribe(Arc::new(SignalForward { tx: tx.clone(), wrap: SessionSignal::SessionDescription }));
    events.dave_control.subscribe(Arc::new(SignalForward { tx: tx.clone(), wrap: SessionSignal::DaveControl }));
    events.resumed.subscribe(Arc::new(SignalForward { tx: tx.clone(), wrap: resumed_signal }));
    events
        .client_disconnect
        .subscribe(Arc::new(SignalForward { tx: tx.clone(), wrap: SessionSignal::ClientDisconnect }));
    events.speaking.subscribe(Arc::new(SignalForward { tx: tx.clone(), wrap: SessionSignal::Speaking }));
    events.error.subscribe(Arc::new(SignalForward { tx: tx.clone(), wrap: SessionSignal::SignallingError }));
    events.socket_closed.subscribe(Arc::new(SignalForward { tx: tx.clone(), wrap: SessionSignal::SocketClosed }));
    events.seq_ack.subscribe(Arc::new(SignalForward { tx: tx.clone(), wrap: SessionSignal::SeqAck }));
}

async fn subscribe_udp_events(events: &Arc<RwLock<UdpEvents>>, tx: &mpsc::Sender<SessionSignal>) {
    let events = events.read().await;
    events.rtp.subscribe(Arc::new(SignalForward { tx: tx.clone(), wrap: SessionSignal::Rtp }));
    events
        .consecutive_failures
        .subscribe(Arc::new(SignalForward { tx: tx.clone(), wrap: SessionSignal::UdpConsecutiveFailures }));
    events.rtcp.subscribe(Arc::new(RtcpPassthrough));
}

/// Every event the session's message loop reacts to, after bridging from the
/// signalling and UDP publishers onto one channel (spec §5).
enum SessionSignal {
    Ready(Ready),
    SessionDescription(SessionDescription),
    DaveControl(ControlFrame),
    Resumed,
    ClientDisconnect(ClientDisconnect),
    Speaking(Speaking),
    SignallingError(SignallingError),
    SocketClosed(u16),
    SeqAck(u64),
    Rtp(DecodedRtpPacket),
    UdpConsecutiveFailures(u32),
}

/// A command sent from a [`Session`] handle into its owning task.
enum SessionCommand {
    SendPcm { pcm: Vec<i16>, reply: oneshot::Sender<VoiceResult<()>> },
    SendOpus { opus: Vec<u8>, reply: oneshot::Sender<VoiceResult<()>> },
    SetSpeaking { flags: SpeakingFlags, reply: oneshot::Sender<VoiceResult<()>> },
    StopSpeaking { reply: oneshot::Sender<VoiceResult<()>> },
    Close { reply: oneshot::Sender<()> },
}

/// Lock-free state a [`Session`] handle can read without round-tripping through the
/// command channel.
#[derive(Default)]
struct SessionShared {
    ssrc: AtomicU32,
    ready: AtomicBool,
    dave_active: AtomicBool,
}

/// Decoded audio and passthrough events a [`Session`]'s caller can observe. The only
/// subscription surface exposed outside the owning task (spec §5 "no shared
/// mutability is exposed").
#[derive(Default)]
pub struct SessionEvents {
    /// Decoded PCM for one inbound SSRC, after DAVE decode (if active) and Opus
    /// decode.
    pub audio: Publisher<(u32, Vec<i16>)>,
    pub client_disconnect: Publisher<ClientDisconnect>,
    pub speaking: Publisher<Speaking>,
    pub error: Publisher<VoiceError>,
}

/// A cheap, clonable handle to one voice connection's message-loop task.
///
/// Grounded in `src/voice/gateway/handle.rs`'s `VoiceGatewayHandle` / `src/voice/udp/handle.rs`'s
/// `UdpHandle`: both are thin `Clone` wrappers around channels into a task that owns
/// the real connection state, never the state itself.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<SessionCommand>,
    shared: Arc<SessionShared>,
    events: Arc<SessionEvents>,
}

impl Session {
    /// Connects the signalling socket, completes Identify/Ready, and spawns the
    /// message-loop task. The UDP transport and DAVE negotiation are driven
    /// reactively once `Ready` and subsequent control frames arrive.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect<G, E, D, DF>(
        endpoint: String,
        identity: SessionIdentity,
        own_user_id: u64,
        group: G,
        key_schedule: Arc<KeySchedule>,
        encoder: E,
        decoder_factory: DF,
        options: SessionOptions,
    ) -> VoiceResult<Session>
    where
        G: GroupStore + Send + Sync + 'static,
        E: Encoder + Send + Sync + 'static,
        D: Decoder + Send + Sync + 'static,
        DF: Fn() -> D + Send + Sync + 'static,
    {
        let signalling = tokio::time::timeout(options.handshake_timeout, SignallingGateway::spawn(&endpoint, identity.clone()))
            .await
            .map_err(|_| VoiceError::Fatal { reason: "signalling handshake timed out".into() })?
            .map_err(VoiceError::from)?;

        let (signal_tx, signal_rx) = mpsc::channel(options.signal_channel_capacity);
        subscribe_signalling_events(&signalling.events, &signal_tx).await;

        let (command_tx, command_rx) = mpsc::channel(32);
        let shared = Arc::new(SessionShared::default());
        let events = Arc::new(SessionEvents::default());

        let task = SessionTask {
            endpoint,
            identity,
            own_user_id,
            options,
            signalling,
            signal_rx,
            signal_tx,
            command_rx,
            udp: None,
            ssrc: None,
            dave: DaveStateMachine::new(group, key_schedule.clone()),
            key_schedule,
            ssrc_to_user: HashMap::new(),
            dave_decrypt_failures: 0,
            decoders: DecoderPool::new(decoder_factory),
            encoder,
            pacer: AudioPacer::new(Instant::now()),
            speaking_flags: SpeakingFlags::empty(),
            silence: None,
            pending: VecDeque::new(),
            shared: shared.clone(),
            events: events.clone(),
            seq_ack: None,
            reconnect_attempt: 0,
            closing: false,
        };

        tokio::spawn(task.run());

        Ok(Session { commands: command_tx, shared, events })
    }

    /// Submits one 20ms PCM frame for Opus encoding and paced transmission. Returns
    /// once the frame has been accepted onto the pacing queue, not once it is
    /// actually on the wire.
    pub async fn send_pcm(&self, pcm: Vec<i16>) -> VoiceResult<()> {
        self.call(|reply| SessionCommand::SendPcm { pcm, reply }).await
    }

    /// Submits an already-Opus-encoded frame, bypassing the encoder.
    pub async fn send_opus_frame(&self, opus: Vec<u8>) -> VoiceResult<()> {
        self.call(|reply| SessionCommand::SendOpus { opus, reply }).await
    }

    /// Updates the speaking-indicator bitflags and sends the corresponding Speaking
    /// payload. Fails if Session-Description has not yet been received (invariant I6).
    pub async fn set_speaking(&self, flags: SpeakingFlags) -> VoiceResult<()> {
        self.call(|reply| SessionCommand::SetSpeaking { flags, reply }).await
    }

    /// Clears the speaking indicator and flushes five silence frames (scenario S4),
    /// so the remote decoder's post-filter doesn't interpolate into a later resume.
    pub async fn stop_speaking(&self) -> VoiceResult<()> {
        self.call(|reply| SessionCommand::StopSpeaking { reply }).await
    }

    /// Flushes silence, closes the signalling socket, and stops the message loop.
    pub async fn close(&self) {
        let (reply, receiver) = oneshot::channel();
        if self.commands.send(SessionCommand::Close { reply }).await.is_ok() {
            let _ = receiver.await;
        }
    }

    async fn call(&self, build: impl FnOnce(oneshot::Sender<VoiceResult<()>>) -> SessionCommand) -> VoiceResult<()> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| VoiceError::Fatal { reason: "session task is no longer running".into() })?;
        receiver
            .await
            .map_err(|_| VoiceError::Fatal { reason: "session task dropped its reply channel".into() })?
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Relaxed)
    }

    pub fn is_dave_active(&self) -> bool {
        self.shared.dave_active.load(Ordering::Relaxed)
    }

    pub fn ssrc(&self) -> Option<u32> {
        match self.shared.ssrc.load(Ordering::Relaxed) {
            0 => None,
            ssrc => Some(ssrc),
        }
    }

    pub fn events(&self) -> &Arc<SessionEvents> {
        &self.events
    }
}

/// The task that owns every piece of mutable connection state (spec §5
/// "single-writer-per-session"): the signalling handle, UDP handle, DAVE state
/// machine, frame-key cache, Opus codec, and pacing/silence bookkeeping.
struct SessionTask<G: GroupStore, E: Encoder, D: Decoder, DF: Fn() -> D + Send + Sync> {
    endpoint: String,
    identity: SessionIdentity,
    own_user_id: u64,
    options: SessionOptions,

    signalling: SignallingHandle,
    signal_rx: mpsc::Receiver<SessionSignal>,
    signal_tx: mpsc::Sender<SessionSignal>,
    command_rx: mpsc::Receiver<SessionCommand>,

    udp: Option<UdpHandle>,
    ssrc: Option<u32>,

    dave: DaveStateMachine<G>,
    key_schedule: Arc<KeySchedule>,
    ssrc_to_user: HashMap<u32, u64>,
    dave_decrypt_failures: u32,

    decoders: DecoderPool<D>,
    encoder: E,

    pacer: AudioPacer,
    speaking_flags: SpeakingFlags,
    silence: Option<SilenceFlush>,
    pending: VecDeque<Vec<u8>>,

    shared: Arc<SessionShared>,
    events: Arc<SessionEvents>,

    seq_ack: Option<u64>,
    reconnect_attempt: usize,
    closing: bool,
}

impl<G, E, D, DF> SessionTask<G, E, D, DF>
where
    G: GroupStore + Send + Sync + 'static,
    E: Encoder + Send + Sync + 'static,
    D: Decoder + Send + Sync + 'static,
    DF: Fn() -> D + Send + Sync + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                signal = self.signal_rx.recv() => {
                    if let Some(signal) = signal {
                        if !self.handle_signal(signal).await {
                            break;
                        }
                    }
                }
                due = self.pacer.tick() => {
                    self.send_due_frames(due).await;
                }
            }
        }
        self.teardown().await;
    }

    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::SendPcm { pcm, reply } => {
                let result = self.encode_and_queue(pcm).await;
                let _ = reply.send(result);
                true
            }
            SessionCommand::SendOpus { opus, reply } => {
                self.pending.push_back(opus);
                let _ = reply.send(Ok(()));
                true
            }
            SessionCommand::SetSpeaking { flags, reply } => {
                let result = self.set_speaking(flags).await;
                let _ = reply.send(result);
                true
            }
            SessionCommand::StopSpeaking { reply } => {
                self.silence = Some(SilenceFlush::start());
                let result = self.set_speaking(SpeakingFlags::empty()).await;
                let _ = reply.send(result);
                true
            }
            SessionCommand::Close { reply } => {
                self.closing = true;
                self.flush_silence_immediately().await;
                self.signalling.close().await;
                let _ = reply.send(());
                false
            }
        }
    }

    async fn encode_and_queue(&mut self, pcm: Vec<i16>) -> VoiceResult<()> {
        if pcm.len() != crate::opus::FRAME_SAMPLES_TOTAL {
            return Err(VoiceError::from(OpusError::WrongFrameSize {
                got: pcm.len(),
                expected: crate::opus::FRAME_SAMPLES_TOTAL,
            }));
        }
        let opus = self.encoder.encode(&pcm).await.map_err(VoiceError::from)?;
        self.pending.push_back(opus);
        Ok(())
    }

    async fn set_speaking(&mut self, flags: SpeakingFlags) -> VoiceResult<()> {
        if !self.shared.ready.load(Ordering::Relaxed) {
            return Err(VoiceError::Fatal {
                reason: "cannot signal speaking state before Session-Description has been received".into(),
            });
        }
        let ssrc = self.ssrc.ok_or(VoiceError::from(TransportError::NoSsrc))?;
        self.speaking_flags = flags;
        self.signalling
            .send_speaking(&Speaking { speaking: flags.bits(), ssrc, delay: 0, user_id: None })
            .await
            .map_err(VoiceError::from)
    }

    async fn flush_silence_immediately(&mut self) {
        let mut flush = SilenceFlush::start();
        while let Some(frame) = flush.next() {
            let _ = self.send_transport_frame(frame.to_vec()).await;
        }
    }

    async fn handle_signal(&mut self, signal: SessionSignal) -> bool {
        match signal {
            SessionSignal::Ready(ready) => self.handle_ready(ready).await,
            SessionSignal::SessionDescription(description) => {
                self.handle_session_description(description).await;
                true
            }
            SessionSignal::DaveControl(frame) => {
                self.handle_dave_control(frame).await;
                true
            }
            SessionSignal::Resumed => {
                info!("SESSION: resumed without renegotiation");
                true
            }
            SessionSignal::ClientDisconnect(disconnect) => {
                self.ssrc_to_user.retain(|_, user| *user != disconnect.user_id.0);
                self.events.client_disconnect.publish(disconnect).await;
                true
            }
            SessionSignal::Speaking(speaking) => {
                if let Some(user_id) = speaking.user_id {
                    self.ssrc_to_user.insert(speaking.ssrc, user_id.0);
                }
                self.events.speaking.publish(speaking).await;
                true
            }
            SessionSignal::SignallingError(error) => {
                warn!("SESSION: signalling error: {error}");
                self.events.error.publish(VoiceError::from(error)).await;
                true
            }
            SessionSignal::SeqAck(seq) => {
                self.seq_ack = Some(seq);
                true
            }
            SessionSignal::SocketClosed(code) => self.handle_socket_closed(code).await,
            SessionSignal::Rtp(packet) => {
                self.handle_rtp(packet).await;
                true
            }
            SessionSignal::UdpConsecutiveFailures(count) => {
                warn!("SESSION: {count} consecutive AEAD failures on the UDP transport");
                self.events
                    .error
                    .publish(VoiceError::from(TransportError::ConsecutiveDecryptFailures { count }))
                    .await;
                true
            }
        }
    }

    /// Ready hands out the relay address/ssrc/offered AEAD modes; IP discovery is
    /// owned by this session's UDP transport, not the signalling socket, so its
    /// result is fed back in through [`SignallingHandle::external_address_discovered`]
    /// (spec §4.J, §4.K).
    async fn handle_ready(&mut self, ready: Ready) -> bool {
        self.ssrc = Some(ready.ssrc);
        self.shared.ssrc.store(ready.ssrc, Ordering::Relaxed);

        let relay: SocketAddr = match format!("{}:{}", ready.ip, ready.port).parse() {
            Ok(addr) => addr,
            Err(_) => {
                self.events
                    .error
                    .publish(VoiceError::Fatal {
                        reason: format!("relay address {}:{} is not a valid socket address", ready.ip, ready.port),
                    })
                    .await;
                return false;
            }
        };

        let (udp, external) = match UdpHandle::spawn(relay, ready.ssrc).await {
            Ok(pair) => pair,
            Err(error) => {
                self.events.error.publish(VoiceError::from(error)).await;
                return false;
            }
        };

        subscribe_udp_events(&udp.events, &self.signal_tx).await;
        self.udp = Some(udp);

        self.signalling.external_address_discovered(external.address, external.port).await;
        true
    }

    /// Session-Description carries the 32-byte key, AEAD mode, and (optionally) the
    /// negotiated DAVE protocol version (invariant I6).
    async fn handle_session_description(&mut self, description: SessionDescription) {
        let Some(udp) = &self.udp else {
            warn!("SESSION: SessionDescription received before the UDP transport existed");
            return;
        };
        udp.set_cipher(TransportCipher::new(description.mode, description.secret_key)).await;
        self.shared.ready.store(true, Ordering::Relaxed);
        info!("SESSION: ready, mode={:?}", description.mode);
    }

    async fn handle_dave_control(&mut self, frame: ControlFrame) {
        match self.dave.handle(frame).await {
            Ok(responses) => {
                for response in responses {
                    if let Err(error) = self.signalling.send_dave_control(&response).await {
                        warn!("SESSION: failed to send DAVE control response: {error}");
                    }
                }
                self.shared.dave_active.store(self.dave.is_active(), Ordering::Relaxed);
            }
            Err(error) => {
                warn!("SESSION: DAVE control handling failed: {error}");
                self.events.error.publish(VoiceError::from(error)).await;
            }
        }
    }

    /// A resumable close (spec §4.J "Resume", scenario S5) reconnects and resumes
    /// under backoff; a non-resumable one or a disabled `auto_recovery` policy ends
    /// the session.
    async fn handle_socket_closed(&mut self, code: u16) -> bool {
        if self.closing {
            return false;
        }
        self.shared.ready.store(false, Ordering::Relaxed);

        if NON_RESUMABLE_CLOSE_CODES.contains(&code) || !self.options.auto_recovery {
            self.events.error.publish(VoiceError::from(SignallingError::from(code))).await;
            return false;
        }

        self.reconnect().await
    }

    async fn reconnect(&mut self) -> bool {
        loop {
            let delay = self.options.backoff_delay(self.reconnect_attempt);
            debug!("SESSION: reconnecting in {delay:?} (attempt {})", self.reconnect_attempt + 1);
            tokio::time::sleep(delay).await;

            let attempt = tokio::time::timeout(
                self.options.handshake_timeout,
                SignallingGateway::spawn_resume(&self.endpoint, self.identity.clone(), self.seq_ack),
            )
            .await;

            match attempt {
                Ok(Ok(handle)) => {
                    subscribe_signalling_events(&handle.events, &self.signal_tx).await;
                    self.signalling = handle;
                    self.reconnect_attempt = 0;
                    info!("SESSION: reconnected and resumed");
                    return true;
                }
                Ok(Err(error)) => warn!("SESSION: resume attempt failed: {error}"),
                Err(_) => warn!("SESSION: resume attempt timed out"),
            }

            self.reconnect_attempt += 1;
        }
    }

    /// Decrypts an inbound RTP payload's DAVE layer (if active) before handing it to
    /// the per-SSRC Opus decoder (spec §4.G "Receive").
    async fn handle_rtp(&mut self, packet: DecodedRtpPacket) {
        let mut plaintext = packet.plaintext;

        if self.dave.is_active() {
            match self.decode_dave_payload(packet.ssrc, &plaintext).await {
                Ok(decrypted) => {
                    plaintext = decrypted;
                    self.dave_decrypt_failures = 0;
                }
                Err(error) => {
                    warn!("SESSION: DAVE frame decode failed for ssrc {}: {error}", packet.ssrc);
                    if !self.within_dave_grace_window() {
                        self.events.error.publish(VoiceError::from(error)).await;
                    }
                    // Within the grace window or not, a failed DAVE decode never falls
                    // through to the still-encrypted transport plaintext (spec §9 Open
                    // Question, narrowed in DESIGN.md): the packet is dropped and
                    // counted either way, only the fatal-escalation decision differs.
                    return;
                }
            }
        }

        match self.decoders.decode(packet.ssrc, Some(&plaintext)).await {
            Ok(pcm) => self.events.audio.publish((packet.ssrc, pcm)).await,
            Err(error) => warn!("SESSION: opus decode failed for ssrc {}: {error}", packet.ssrc),
        }
    }

    async fn decode_dave_payload(&self, ssrc: u32, datagram: &[u8]) -> Result<Vec<u8>, crate::errors::DaveError> {
        let nonce = dave::frame::peek_nonce(datagram)?;
        let user_id = self.ssrc_to_user.get(&ssrc).copied().unwrap_or(0);
        let frame_key = self.key_schedule.frame_key(user_id, ssrc, nonce.generation)?;
        let decoded = dave::frame::decode(&frame_key, datagram)?;
        Ok(decoded.plaintext)
    }

    /// `true` while decrypt failures remain within the configured grace window (spec
    /// §9 Open Question, narrowed per [`SessionOptions::dave_grace_window_frames`]).
    fn within_dave_grace_window(&mut self) -> bool {
        self.dave_decrypt_failures += 1;
        match self.options.dave_grace_window_frames {
            Some(limit) => self.dave_decrypt_failures <= limit,
            None => false,
        }
    }

    async fn send_due_frames(&mut self, due: u32) {
        for _ in 0..due {
            if let Some(opus) = self.pending.pop_front() {
                if let Err(error) = self.send_transport_frame(opus).await {
                    warn!("SESSION: failed to send audio frame: {error}");
                }
                continue;
            }

            if let Some(silence) = &mut self.silence {
                if let Some(frame) = silence.next() {
                    let frame = frame.to_vec();
                    let _ = self.send_transport_frame(frame).await;
                }
                if silence.is_done() {
                    self.silence = None;
                }
            }
        }
    }

    /// Encrypts (if DAVE is active) and transmits one Opus payload, advancing the
    /// DAVE nonce and RTP sequence/timestamp.
    async fn send_transport_frame(&mut self, opus_payload: Vec<u8>) -> VoiceResult<()> {
        let Some(udp) = &self.udp else {
            return Err(VoiceError::from(TransportError::NoSsrc));
        };

        let payload = if self.dave.is_active() {
            let nonce = self.dave.next_nonce();
            let frame_key = self
                .key_schedule
                .frame_key(self.own_user_id, self.ssrc.unwrap_or(0), nonce.generation)
                .map_err(VoiceError::from)?;
            dave::frame::encode(&frame_key, nonce, &opus_payload).map_err(VoiceError::from)?
        } else {
            opus_payload
        };

        udp.send(&payload).await.map_err(VoiceError::from)
    }

    async fn teardown(&mut self) {
        self.signalling.close().await;
        info!("SESSION: task finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_caps_catch_up_at_two_frames() {
        let start = Instant::now();
        let mut pacer = AudioPacer::new(start);

        // Far in the future: several periods have elapsed, but the cap limits the
        // burst to two frames per poll (spec §4.K).
        let later = start + Duration::from_millis(200);
        let first = pacer.due_frames(later);
        assert_eq!(first, 2);

        // Immediately re-polling at the same instant yields nothing further, since
        // resynchronisation already moved the deadline past `later`.
        let second = pacer.due_frames(later);
        assert_eq!(second, 0);
    }

    #[test]
    fn pacer_yields_one_frame_per_period_in_steady_state() {
        let start = Instant::now();
        let mut pacer = AudioPacer::new(start);

        let tick = start + Duration::from_millis(20);
        assert_eq!(pacer.due_frames(tick), 1);

        let next_tick = tick + Duration::from_millis(20);
        assert_eq!(pacer.due_frames(next_tick), 1);
    }

    #[test]
    fn pacer_yields_nothing_before_its_deadline() {
        let start = Instant::now();
        let mut pacer = AudioPacer::new(start);
        assert_eq!(pacer.due_frames(start + Duration::from_millis(5)), 0);
    }

    #[test]
    fn backoff_schedule_caps_at_the_configured_ceiling() {
        let options = SessionOptions::default();
        assert_eq!(options.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(options.backoff_delay(1), Duration::from_millis(400));
        assert_eq!(options.backoff_delay(2), Duration::from_millis(1600));
        assert_eq!(options.backoff_delay(10), options.max_reconnect_backoff);
    }
}
