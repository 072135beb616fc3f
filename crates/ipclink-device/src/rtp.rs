use bytes::Bytes;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::util::marshal::Marshal;

use crate::error::DeviceError;

pub const TALK_PAYLOAD_TYPE: u8 = 65;
pub const TALK_SSRC: u32 = 0x78;
pub const TALK_INITIAL_TIMESTAMP: u32 = 0x15f90;

/// RTP framing for uploaded talk audio (8 kHz A-law, one byte per sample).
///
/// Sequence number and timestamp advance per packet, both wrapping. The
/// caller advances only after the packet actually reached the device.
#[derive(Debug, Clone)]
pub struct TalkPacketizer {
    sequence_number: u16,
    timestamp: u32,
}

impl Default for TalkPacketizer {
    fn default() -> Self {
        Self {
            sequence_number: 0,
            timestamp: TALK_INITIAL_TIMESTAMP,
        }
    }
}

impl TalkPacketizer {
    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// RTP header + `audio`, stamped with the current sequence/timestamp.
    pub fn packetize(&self, audio: &[u8]) -> Result<Bytes, DeviceError> {
        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: TALK_PAYLOAD_TYPE,
                sequence_number: self.sequence_number,
                timestamp: self.timestamp,
                ssrc: TALK_SSRC,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(audio),
        };
        Ok(packet.marshal()?)
    }

    pub fn advance(&mut self, samples: usize) {
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples as u32);
    }
}
