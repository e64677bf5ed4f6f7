use crate::rtp::{ExtensionIds, RtpPacket};

/// SSRC of the probation RTP stream.
const PROBATION_SSRC: u32 = 1234;

/// Payload type of probation packets.
const PROBATION_PAYLOAD_TYPE: u8 = 127;

// Probation RTP header template. One-byte header extensions with space
// for abs-send-time (3 bytes) and transport-wide-cc-01 (2 bytes).
#[rustfmt::skip]
const PROBATION_PACKET_HEADER: &[u8] = &[
    0b1001_0000, PROBATION_PAYLOAD_TYPE, 0, 0, // PayloadType: 127, Sequence Number: 0
    0, 0, 0, 0,                                // Timestamp: 0
    0, 0, 0, 0,                                // SSRC: 0
    0xBE, 0xDE, 0, 2,                          // Header Extension (One-Byte Extensions)
    (ABS_SEND_TIME_ID << 4) | 2, 0, 0, 0,      // abs-send-time extension.
    (TRANSPORT_WIDE_CC_ID << 4) | 1, 0, 0, 0,  // transport-wide-cc-01 extension.
];

// Extension ids baked into the template.
const ABS_SEND_TIME_ID: u8 = 1;
const TRANSPORT_WIDE_CC_ID: u8 = 2;

/// Generates padding RTP packets for bandwidth probing.
///
/// One reusable packet is kept; every [`RtpProbationGenerator::get_next_packet`]
/// bumps its sequence number and timestamp and hands out the same buffer.
/// The caller must serialize/copy before asking for the next one.
#[derive(Debug)]
pub struct RtpProbationGenerator {
    probation_packet: RtpPacket,
}

impl RtpProbationGenerator {
    /// The extension id table the probation packet is built with.
    pub fn extension_ids() -> ExtensionIds {
        ExtensionIds {
            abs_send_time: Some(ABS_SEND_TIME_ID),
            transport_wide_cc01: Some(TRANSPORT_WIDE_CC_ID),
            ..Default::default()
        }
    }

    /// Create a generator producing packets of `probation_packet_len`
    /// bytes. The length must cover at least the header template.
    pub fn new(probation_packet_len: usize) -> Self {
        assert!(
            probation_packet_len >= PROBATION_PACKET_HEADER.len(),
            "probation_packet_len too small"
        );

        let mut buf = vec![0_u8; probation_packet_len];
        buf[..PROBATION_PACKET_HEADER.len()].copy_from_slice(PROBATION_PACKET_HEADER);

        let mut probation_packet =
            RtpPacket::parse(buf, &Self::extension_ids()).expect("valid probation template");

        probation_packet.set_ssrc(PROBATION_SSRC.into());
        probation_packet.set_sequence_number(rand::random());
        probation_packet.set_timestamp(rand::random());

        RtpProbationGenerator { probation_packet }
    }

    /// The next probation packet: sequence number advanced by 1,
    /// timestamp advanced by 20. The returned packet is shared; it is
    /// mutated again by the next call.
    pub fn get_next_packet(&mut self) -> &mut RtpPacket {
        let seq = self.probation_packet.sequence_number().wrapping_add(1);
        let timestamp = self.probation_packet.timestamp().wrapping_add(20);

        self.probation_packet.set_sequence_number(seq);
        self.probation_packet.set_timestamp(timestamp);

        &mut self.probation_packet
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packet_advances_seq_and_timestamp() {
        let mut generator = RtpProbationGenerator::new(200);

        let (seq1, ts1) = {
            let p = generator.get_next_packet();
            (p.sequence_number(), p.timestamp())
        };
        let (seq2, ts2) = {
            let p = generator.get_next_packet();
            (p.sequence_number(), p.timestamp())
        };

        assert_eq!(seq2, seq1.wrapping_add(1));
        assert_eq!(ts2, ts1.wrapping_add(20));
    }

    #[test]
    fn packet_has_fixed_ssrc_and_bwe_extensions() {
        let mut generator = RtpProbationGenerator::new(200);
        let packet = generator.get_next_packet();

        assert_eq!(*packet.ssrc(), 1234);
        assert_eq!(*packet.header().payload_type, 127);
        assert_eq!(packet.len(), 200);

        assert!(packet.set_transport_wide_cc01(42));
        assert!(packet.set_abs_send_time(1000));
    }

    #[test]
    #[should_panic(expected = "probation_packet_len too small")]
    fn too_short_length_panics() {
        RtpProbationGenerator::new(10);
    }
}
