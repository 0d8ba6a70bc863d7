// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IP discovery handshake and packet I/O to the voice relay.
//!
//! A listener task receives and demuxes datagrams, a cloneable handle sends.
//! Generalised from xsalsa20poly1305 to the rtpsize AEAD modes and from per-packet
//! ad-hoc decryption to the shared [`TransportCipher`]/[`NonceCounter`] components.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use discortp::demux::{demux, Demuxed};
use discortp::rtcp::report::{ReceiverReport, SenderReport};
use discortp::rtcp::{Rtcp, RtcpPacket};
use log::*;
use pubserve::Publisher;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};

use crate::errors::TransportError;
use crate::transport::buffer_pool::BufferPool;
use crate::transport::cipher::TransportCipher;
use crate::transport::discovery::{build_request, parse_response, ExternalAddress, IP_DISCOVERY_PACKET_SIZE};
use crate::transport::nonce::NonceCounter;
use crate::transport::rtp::{assemble, parse_and_open, DecodedRtpPacket, RTP_TIMESTAMP_STEP};

/// Maximum plausible RTP/RTCP datagram size, per
/// <https://stackoverflow.com/questions/58097580/rtp-packet-maximum-size>: "the RTP
/// standard does not set a maximum size". 1460 covers the practical Ethernet MTU case.
const RECV_BUFFER_SIZE: usize = 1460;

const IP_DISCOVERY_ATTEMPTS: u8 = 3;
const IP_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Three consecutive authentication failures at the head of a newly keyed stream are
/// fatal for the session.
const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;

/// Published events from the UDP transport.
#[derive(Default)]
pub struct UdpEvents {
    /// A successfully decrypted RTP packet, optionally still DAVE-encoded (the
    /// session applies DAVE decode before this reaches an Opus decoder).
    pub rtp: Publisher<DecodedRtpPacket>,
    /// A passthrough RTCP sender/receiver report; never DAVE- or AEAD-processed
    /// beyond what the relay itself applies.
    pub rtcp: Publisher<Rtcp>,
    /// Emitted once three consecutive AEAD failures occur at the head of a new key.
    pub consecutive_failures: Publisher<u32>,
}

/// Performs IP discovery: sends a 74-byte request, retries up to
/// three times with a 1s timeout before failing the session.
pub async fn discover_external_address(
    socket: &UdpSocket,
    ssrc: u32,
) -> Result<ExternalAddress, TransportError> {
    let request = build_request(ssrc);
    let mut buf = vec![0u8; IP_DISCOVERY_PACKET_SIZE];

    for attempt in 1..=IP_DISCOVERY_ATTEMPTS {
        socket.send(&request).await.map_err(|e| TransportError::BrokenSocket {
            error: e.to_string(),
        })?;

        match tokio::time::timeout(IP_DISCOVERY_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(size)) => return parse_response(&buf[..size]),
            Ok(Err(e)) => {
                return Err(TransportError::BrokenSocket { error: e.to_string() });
            }
            Err(_timed_out) => {
                debug!("UDP: IP discovery attempt {attempt}/{IP_DISCOVERY_ATTEMPTS} timed out");
            }
        }
    }

    Err(TransportError::IpDiscoveryTimedOut { attempts: IP_DISCOVERY_ATTEMPTS })
}

/// Shared send-path state: the session key, nonce counter, and RTP sequence/timestamp
/// progression. Exclusively owned by the session task.
struct SendState {
    cipher: Option<TransportCipher>,
    nonce: NonceCounter,
    sequence: u16,
    timestamp: u32,
    consecutive_failures: u32,
}

impl SendState {
    fn new() -> Self {
        Self {
            cipher: None,
            nonce: NonceCounter::new(),
            sequence: 0,
            timestamp: 0,
            consecutive_failures: 0,
        }
    }

    /// Rotates the transport key: resets the nonce counter and the consecutive
    /// failure count.
    fn rotate_key(&mut self, cipher: TransportCipher) {
        self.cipher = Some(cipher);
        self.nonce.reset();
        self.consecutive_failures = 0;
    }
}

/// Handle to a voice UDP connection. Clonable; every clone shares the same socket
/// and send-path state.
#[derive(Clone)]
pub struct UdpHandle {
    socket: Arc<UdpSocket>,
    ssrc: u32,
    send_state: Arc<Mutex<SendState>>,
    buffer_pool: Arc<BufferPool>,
    pub events: Arc<RwLock<UdpEvents>>,
}

impl UdpHandle {
    /// Binds a UDP socket, connects it to `relay`, performs IP discovery on it, and
    /// only then spawns the receive/demux task -- discovery must finish first, since
    /// the listener would otherwise race it for the same incoming datagrams.
    pub async fn spawn(relay: SocketAddr, ssrc: u32) -> Result<(Self, ExternalAddress), TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| TransportError::BrokenSocket { error: e.to_string() })?;
        socket
            .connect(relay)
            .await
            .map_err(|e| TransportError::BrokenSocket { error: e.to_string() })?;

        let external_address = discover_external_address(&socket, ssrc).await?;

        let socket = Arc::new(socket);
        let handle = Self {
            socket: socket.clone(),
            ssrc,
            send_state: Arc::new(Mutex::new(SendState::new())),
            buffer_pool: Arc::new(BufferPool::new(8, RECV_BUFFER_SIZE)),
            events: Arc::new(RwLock::new(UdpEvents::default())),
        };

        let listener = handle.clone();
        tokio::spawn(async move {
            listener.listen_task().await;
        });

        Ok((handle, external_address))
    }

    /// Installs a new transport cipher, rotating the nonce counter and failure count.
    pub async fn set_cipher(&self, cipher: TransportCipher) {
        self.send_state.lock().await.rotate_key(cipher);
    }

    /// Seals and sends one payload (already DAVE-encoded if DAVE is active). Advances
    /// sequence and timestamp by the caller-supplied frame sample count (typically
    /// [`RTP_TIMESTAMP_STEP`]).
    pub async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.send_with_timestamp_step(payload, RTP_TIMESTAMP_STEP).await
    }

    pub async fn send_with_timestamp_step(&self, payload: &[u8], step: u32) -> Result<(), TransportError> {
        let mut state = self.send_state.lock().await;
        let cipher = state.cipher.as_ref().ok_or(TransportError::NoKey)?;
        let counter = state.nonce.next()?;
        let sequence = state.sequence;
        let timestamp = state.timestamp;

        let mut buf = self.buffer_pool.lease();
        buf.clear();
        buf.extend_from_slice(&assemble(cipher, sequence, timestamp, self.ssrc, counter, payload)?);

        self.socket
            .send(&buf)
            .await
            .map_err(|e| TransportError::BrokenSocket { error: e.to_string() })?;

        state.sequence = sequence.wrapping_add(1);
        state.timestamp = timestamp.wrapping_add(step);

        trace!("UDP: sent rtp packet seq={sequence} ts={timestamp}");
        Ok(())
    }

    async fn listen_task(&self) {
        loop {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            let size = match self.socket.recv(&mut buf).await {
                Ok(size) => size,
                Err(e) => {
                    warn!("UDP: socket broken, stopping receive task: {e}");
                    break;
                }
            };

            self.handle_datagram(&buf[..size]).await;
        }
    }

    async fn handle_datagram(&self, datagram: &[u8]) {
        match demux(datagram) {
            Demuxed::Rtp(rtp) => {
                let decoded = {
                    let mut state = self.send_state.lock().await;
                    let Some(cipher) = state.cipher.as_ref() else {
                        trace!("UDP: dropping rtp packet, no key yet");
                        return;
                    };
                    let result = parse_and_open(cipher, rtp.packet());
                    match result {
                        Ok(decoded) => {
                            state.consecutive_failures = 0;
                            Some(decoded)
                        }
                        Err(e) => {
                            state.consecutive_failures += 1;
                            warn!("UDP: failed to decrypt rtp packet: {e}");
                            if state.consecutive_failures >= CONSECUTIVE_FAILURE_LIMIT {
                                let count = state.consecutive_failures;
                                drop(state);
                                self.events.read().await.consecutive_failures.publish(count).await;
                            }
                            None
                        }
                    }
                };

                if let Some(decoded) = decoded {
                    self.events.read().await.rtp.publish(decoded).await;
                }
            }
            Demuxed::Rtcp(rtcp) => {
                let rtcp_data = match rtcp {
                    RtcpPacket::KnownType(known) => Rtcp::KnownType(known),
                    RtcpPacket::SenderReport(sr) => Rtcp::SenderReport(SenderReport {
                        payload: sr.payload().to_vec(),
                        padding: sr.get_padding(),
                        version: sr.get_version(),
                        ssrc: sr.get_ssrc(),
                        pkt_length: sr.get_pkt_length(),
                        packet_type: sr.get_packet_type(),
                        rx_report_count: sr.get_rx_report_count(),
                    }),
                    RtcpPacket::ReceiverReport(rr) => Rtcp::ReceiverReport(ReceiverReport {
                        payload: rr.payload().to_vec(),
                        padding: rr.get_padding(),
                        version: rr.get_version(),
                        ssrc: rr.get_ssrc(),
                        pkt_length: rr.get_pkt_length(),
                        packet_type: rr.get_packet_type(),
                        rx_report_count: rr.get_rx_report_count(),
                    }),
                    _ => return,
                };
                self.events.read().await.rtcp.publish(rtcp_data).await;
            }
            Demuxed::FailedParse(e) => {
                trace!("UDP: failed to parse datagram as rtp/rtcp: {e:?}");
            }
            Demuxed::TooSmall => {}
        }
    }
}
