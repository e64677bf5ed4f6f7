use super::ext::ExtensionIds;
use super::header::RtpHeader;
use super::{Pt, Ssrc};

/// An owned RTP packet with in-place header mutation.
///
/// The routing fast path works on borrowed [`RtpHeader`] views; this owned
/// form exists for packets the router itself originates or rewrites:
/// probation padding and consumer-bound media with rewritten
/// SSRC/sequence/timestamp. Mutators patch the underlying bytes directly
/// so the buffer is always ready to hand to the wire.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    buf: Vec<u8>,
    header: RtpHeader,
}

impl RtpPacket {
    pub fn parse(buf: Vec<u8>, ids: &ExtensionIds) -> Option<RtpPacket> {
        let header = RtpHeader::parse(&buf, ids)?;
        Some(RtpPacket { buf, header })
    }

    pub fn header(&self) -> &RtpHeader {
        &self.header
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header.header_len..]
    }

    pub fn ssrc(&self) -> Ssrc {
        self.header.ssrc
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn set_ssrc(&mut self, ssrc: Ssrc) {
        self.buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        self.header.ssrc = ssrc;
    }

    pub fn set_sequence_number(&mut self, seq: u16) {
        self.buf[2..4].copy_from_slice(&seq.to_be_bytes());
        self.header.sequence_number = seq;
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.buf[4..8].copy_from_slice(&timestamp.to_be_bytes());
        self.header.timestamp = timestamp;
    }

    pub fn set_marker(&mut self, marker: bool) {
        if marker {
            self.buf[1] |= 0x80;
        } else {
            self.buf[1] &= 0x7f;
        }
        self.header.marker = marker;
    }

    pub fn set_payload_type(&mut self, pt: Pt) {
        self.buf[1] = (self.buf[1] & 0x80) | (*pt & 0x7f);
        self.header.payload_type = pt;
    }

    /// Patch the transport-wide sequence number extension, if the packet
    /// has space for it. Returns whether the value was written.
    pub fn set_transport_wide_cc01(&mut self, wide_seq: u16) -> bool {
        let Some(at) = self.header.ext_offsets.transport_wide_cc01 else {
            return false;
        };
        self.buf[at..at + 2].copy_from_slice(&wide_seq.to_be_bytes());
        self.header.ext_vals.transport_cc = Some(wide_seq);
        true
    }

    /// Patch the abs-send-time extension with `now_ms` converted to the
    /// 24 bit 6.18 fixed point seconds format. Returns whether the value
    /// was written.
    pub fn set_abs_send_time(&mut self, now_ms: u64) -> bool {
        let Some(at) = self.header.ext_offsets.abs_send_time else {
            return false;
        };
        let abs = (((now_ms << 18) + 500) / 1000) & 0x00FF_FFFF;
        let bytes = (abs as u32).to_be_bytes();
        self.buf[at..at + 3].copy_from_slice(&bytes[1..4]);
        self.header.ext_vals.abs_send_time = Some(abs as u32);
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ids() -> ExtensionIds {
        ExtensionIds {
            abs_send_time: Some(2),
            transport_wide_cc01: Some(3),
            ..Default::default()
        }
    }

    #[rustfmt::skip]
    fn probation_like() -> Vec<u8> {
        vec![
            0b1001_0000, 0x7f, 0x00, 0x05,
            0x00, 0x00, 0x00, 0x14,
            0x00, 0x00, 0x04, 0xD2,
            0xBE, 0xDE, 0x00, 0x02,
            0x22, 0x00, 0x00, 0x00,
            0x31, 0x00, 0x00, 0x00,
        ]
    }

    #[test]
    fn patch_fixed_header() {
        let mut packet = RtpPacket::parse(probation_like(), &ids()).unwrap();

        packet.set_ssrc(0xCAFE.into());
        packet.set_sequence_number(1000);
        packet.set_timestamp(90_000);

        let reparsed = RtpPacket::parse(packet.as_bytes().to_vec(), &ids()).unwrap();
        assert_eq!(*reparsed.ssrc(), 0xCAFE);
        assert_eq!(reparsed.sequence_number(), 1000);
        assert_eq!(reparsed.timestamp(), 90_000);
    }

    #[test]
    fn patch_extensions() {
        let mut packet = RtpPacket::parse(probation_like(), &ids()).unwrap();

        assert!(packet.set_transport_wide_cc01(777));
        assert!(packet.set_abs_send_time(1000));

        let reparsed = RtpPacket::parse(packet.as_bytes().to_vec(), &ids()).unwrap();
        assert_eq!(reparsed.header().ext_vals.transport_cc, Some(777));
        // 1 second in 6.18 fixed point.
        assert_eq!(reparsed.header().ext_vals.abs_send_time, Some(1 << 18));
    }

    #[test]
    fn no_extension_slot_is_reported() {
        let mut buf = probation_like();
        buf.truncate(12);
        buf[0] = 0b1000_0000; // no extension bit

        let mut packet = RtpPacket::parse(buf, &ids()).unwrap();
        assert!(!packet.set_transport_wide_cc01(1));
        assert!(!packet.set_abs_send_time(1));
    }
}
