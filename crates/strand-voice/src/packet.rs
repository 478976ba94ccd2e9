use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::crypto::PacketCipher;
use crate::error::VoiceError;

/// Version 2, no padding, no extension, no CSRC.
pub const RTP_VERSION_FLAGS: u8 = 0x80;
/// Dynamic payload type used for voice.
pub const RTP_PAYLOAD_TYPE: u8 = 0x78;
pub const RTP_HEADER_SIZE: usize = 12;

/// Payload a client sends before it starts talking; also what arrives from
/// a participant whose SSRC is not announced yet.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Size of an IP discovery request or response.
pub const DISCOVERY_PACKET_SIZE: usize = 74;
const DISCOVERY_REQUEST: u16 = 0x1;
const DISCOVERY_RESPONSE: u16 = 0x2;
const DISCOVERY_BODY_LENGTH: u16 = 70;
const DISCOVERY_ADDRESS_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },
    #[error("unsupported RTP version in first byte {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("unexpected discovery packet type {0}")]
    UnexpectedDiscoveryType(u16),
    #[error("discovery address is not valid UTF-8")]
    InvalidAddress,
}

/// 12-byte RTP header.
///
/// ```text
/// Byte 0:     0x80 (version 2)
/// Byte 1:     0x78 (payload type)
/// Bytes 2-3:  Sequence number (u16)
/// Bytes 4-7:  Timestamp (u32, 48 kHz clock)
/// Bytes 8-11: SSRC (u32)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(RTP_VERSION_FLAGS);
        buf.put_u8(RTP_PAYLOAD_TYPE);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Decode a header. Only the version bits are checked; marker and payload
    /// type are ignored.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, PacketError> {
        if buf.remaining() < RTP_HEADER_SIZE {
            return Err(PacketError::BufferTooShort {
                expected: RTP_HEADER_SIZE,
                actual: buf.remaining(),
            });
        }
        let flags = buf.get_u8();
        if flags >> 6 != 2 {
            return Err(PacketError::UnsupportedVersion(flags));
        }
        let _payload_type = buf.get_u8();
        Ok(Self {
            sequence: buf.get_u16(),
            timestamp: buf.get_u32(),
            ssrc: buf.get_u32(),
        })
    }

    pub fn to_array(&self) -> [u8; RTP_HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE);
        self.encode(&mut buf);
        let mut out = [0u8; RTP_HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }
}

/// A voice datagram with its payload in the clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl AudioPacket {
    pub fn new(header: RtpHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    pub fn is_silence(&self) -> bool {
        self.payload[..] == SILENCE_FRAME[..]
    }

    /// Header followed by the encrypted payload.
    pub fn seal(&self, cipher: &PacketCipher) -> Result<Bytes, VoiceError> {
        let header = self.header.to_array();
        let ciphertext = cipher.encrypt(&header, &self.payload)?;
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + ciphertext.len());
        buf.put_slice(&header);
        buf.put_slice(&ciphertext);
        Ok(buf.freeze())
    }

    /// Parse and decrypt a received datagram.
    pub fn open(datagram: &[u8], cipher: &PacketCipher) -> Result<Self, VoiceError> {
        let mut buf = datagram;
        let header = RtpHeader::decode(&mut buf)?;
        let mut raw_header = [0u8; RTP_HEADER_SIZE];
        raw_header.copy_from_slice(&datagram[..RTP_HEADER_SIZE]);
        let payload = cipher.decrypt(&raw_header, buf)?;
        Ok(Self {
            header,
            payload: Bytes::from(payload),
        })
    }
}

/// IP discovery request/response.
///
/// ```text
/// Bytes 0-1:   Type (0x1 request, 0x2 response)
/// Bytes 2-3:   Length of the rest (70)
/// Bytes 4-7:   SSRC
/// Bytes 8-71:  Address, NUL padded
/// Bytes 72-73: Port
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpDiscovery {
    pub response: bool,
    pub ssrc: u32,
    pub address: String,
    pub port: u16,
}

impl IpDiscovery {
    pub fn request(ssrc: u32) -> Self {
        Self {
            response: false,
            ssrc,
            address: String::new(),
            port: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DISCOVERY_PACKET_SIZE);
        buf.put_u16(if self.response {
            DISCOVERY_RESPONSE
        } else {
            DISCOVERY_REQUEST
        });
        buf.put_u16(DISCOVERY_BODY_LENGTH);
        buf.put_u32(self.ssrc);
        let address = self.address.as_bytes();
        let len = address.len().min(DISCOVERY_ADDRESS_SIZE - 1);
        buf.put_slice(&address[..len]);
        buf.put_bytes(0, DISCOVERY_ADDRESS_SIZE - len);
        buf.put_u16(self.port);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < DISCOVERY_PACKET_SIZE {
            return Err(PacketError::BufferTooShort {
                expected: DISCOVERY_PACKET_SIZE,
                actual: buf.len(),
            });
        }
        let response = match buf.get_u16() {
            DISCOVERY_REQUEST => false,
            DISCOVERY_RESPONSE => true,
            other => return Err(PacketError::UnexpectedDiscoveryType(other)),
        };
        let _length = buf.get_u16();
        let ssrc = buf.get_u32();
        let raw = &buf[..DISCOVERY_ADDRESS_SIZE];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let address = std::str::from_utf8(&raw[..end])
            .map_err(|_| PacketError::InvalidAddress)?
            .to_string();
        buf.advance(DISCOVERY_ADDRESS_SIZE);
        let port = buf.get_u16();
        Ok(Self {
            response,
            ssrc,
            address,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = RtpHeader::new(0x0102, 0x0304_0506, 0x0708_090A);
        assert_eq!(
            header.to_array(),
            [0x80, 0x78, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]
        );
        let raw = header.to_array();
        let mut buf = &raw[..];
        assert_eq!(RtpHeader::decode(&mut buf).unwrap(), header);
    }

    #[test]
    fn header_rejects_short_and_wrong_version() {
        let mut short = &[0x80u8, 0x78, 0, 1][..];
        assert!(matches!(
            RtpHeader::decode(&mut short),
            Err(PacketError::BufferTooShort { expected: 12, actual: 4 })
        ));
        let mut wrong = &[0x40u8; 12][..];
        assert!(matches!(
            RtpHeader::decode(&mut wrong),
            Err(PacketError::UnsupportedVersion(0x40))
        ));
    }

    #[test]
    fn sealed_packet_opens_with_same_key() {
        let cipher = PacketCipher::new(&[7u8; 32]).unwrap();
        let packet = AudioPacket::new(RtpHeader::new(1, 960, 42), vec![1u8, 2, 3, 4]);
        let datagram = packet.seal(&cipher).unwrap();
        assert_eq!(&datagram[..2], &[0x80, 0x78]);
        assert_eq!(AudioPacket::open(&datagram, &cipher).unwrap(), packet);

        let other = PacketCipher::new(&[8u8; 32]).unwrap();
        assert!(AudioPacket::open(&datagram, &other).is_err());
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let cipher = PacketCipher::new(&[7u8; 32]).unwrap();
        let packet = AudioPacket::new(RtpHeader::new(1, 960, 42), SILENCE_FRAME.to_vec());
        let mut datagram = packet.seal(&cipher).unwrap().to_vec();
        datagram[11] ^= 0x01;
        assert!(AudioPacket::open(&datagram, &cipher).is_err());
        assert!(packet.is_silence());
    }

    #[test]
    fn discovery_is_74_bytes() {
        let request = IpDiscovery::request(99).encode();
        assert_eq!(request.len(), DISCOVERY_PACKET_SIZE);
        assert_eq!(&request[..8], &[0, 1, 0, 70, 0, 0, 0, 99]);

        let response = IpDiscovery {
            response: true,
            ssrc: 99,
            address: "203.0.113.7".into(),
            port: 50_004,
        };
        let decoded = IpDiscovery::decode(&response.encode()).unwrap();
        assert_eq!(decoded, response);
    }
}
