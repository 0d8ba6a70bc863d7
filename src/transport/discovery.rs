// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IP discovery packet construction and parsing.
//!
//! Built on `discortp::discord::{IpDiscovery, IpDiscoveryPacket,
//! MutableIpDiscoveryPacket}`.

use discortp::discord::{IpDiscovery, IpDiscoveryPacket, IpDiscoveryType, MutableIpDiscoveryPacket};
use discortp::Packet;

use crate::errors::TransportError;

/// Total wire size of an IP discovery request/response.
pub const IP_DISCOVERY_PACKET_SIZE: usize = 74;

/// Builds the 74-byte IP discovery request for the given SSRC:
/// `type=0x0001(be16), length=70(be16), ssrc(be32), 66 zero bytes`.
pub fn build_request(ssrc: u32) -> Vec<u8> {
    let request = IpDiscovery {
        pkt_type: IpDiscoveryType::Request,
        length: 70,
        ssrc,
        address: Vec::new(),
        port: 0,
        payload: Vec::new(),
    };

    let mut buf = vec![0u8; IpDiscoveryPacket::minimum_packet_size() + 64];
    let mut packet = MutableIpDiscoveryPacket::new(&mut buf)
        .expect("IP discovery request buffer sized incorrectly");
    packet.populate(&request);
    buf
}

/// The parsed external address and port from an IP discovery response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAddress {
    pub address: String,
    pub port: u16,
}

/// Parses a received IP discovery response, extracting the external IP and port.
///
/// The relay responds with `type=0x0002`, a 64-byte null-terminated external address
/// starting at byte 8, and a 16-bit external port in the last 2 bytes.
pub fn parse_response(datagram: &[u8]) -> Result<ExternalAddress, TransportError> {
    let packet = IpDiscoveryPacket::new(datagram).ok_or(TransportError::IpDiscoveryMalformed)?;

    if packet.get_pkt_type() != IpDiscoveryType::Response {
        return Err(TransportError::IpDiscoveryMalformed);
    }

    let raw_address = packet.get_address();
    let nul = raw_address.iter().position(|&b| b == 0).unwrap_or(raw_address.len());
    let address = String::from_utf8_lossy(&raw_address[..nul]).into_owned();

    Ok(ExternalAddress {
        address,
        port: packet.get_port(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_matches_expected_bytes() {
        let request = build_request(0xCAFEBABE);
        assert_eq!(request.len(), IP_DISCOVERY_PACKET_SIZE);
        assert_eq!(&request[0..8], &[0x00, 0x01, 0x00, 0x46, 0xCA, 0xFE, 0xBA, 0xBE]);
        assert!(request[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn response_round_trip() {
        let mut buf = vec![0u8; IP_DISCOVERY_PACKET_SIZE];
        let response = IpDiscovery {
            pkt_type: IpDiscoveryType::Response,
            length: 70,
            ssrc: 42,
            address: {
                let mut addr = b"203.0.113.7".to_vec();
                addr.resize(64, 0);
                addr
            },
            port: 51820,
            payload: Vec::new(),
        };
        let mut packet = MutableIpDiscoveryPacket::new(&mut buf).unwrap();
        packet.populate(&response);

        let parsed = parse_response(&buf).unwrap();
        assert_eq!(parsed.address, "203.0.113.7");
        assert_eq!(parsed.port, 51820);
    }
}
