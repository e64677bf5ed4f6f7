#![allow(clippy::unusual_byte_groupings)]

use std::str::from_utf8;

use super::ext::{ExtensionIds, ExtensionUri};
use super::{Mid, Pt, Rid, Ssrc};

/// Parsed, non-owning view of an RTP packet header.
///
/// Borrowed from the receive buffer for the duration of one receive
/// callback; nothing in here keeps the datagram alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Always 2.
    pub version: u8,
    /// Whether the packet carries padding at the end of the payload.
    pub has_padding: bool,
    /// Whether a header extension block is present.
    pub has_extension: bool,
    /// For video the marker signifies the end of a frame.
    pub marker: bool,
    /// Payload type, mapping negotiated in signaling.
    pub payload_type: Pt,
    /// 16 bit sequence number as it appears on the wire.
    pub sequence_number: u16,
    /// Media timestamp, time base depends on the codec.
    pub timestamp: u32,
    /// Sender source identifier.
    pub ssrc: Ssrc,
    /// Extension values resolved via the transport's id table.
    pub ext_vals: ExtensionValues,
    /// Length of the header, including the extension block.
    pub header_len: usize,
    /// Absolute byte offsets of patchable extension values.
    pub(crate) ext_offsets: ExtOffsets,
}

/// Values of recognised header extensions found in a packet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionValues {
    pub mid: Option<Mid>,
    pub rid: Option<Rid>,
    pub rrid: Option<Rid>,
    /// 6.18 fixed point seconds, 24 bits.
    pub abs_send_time: Option<u32>,
    /// Transport-wide sequence number.
    pub transport_cc: Option<u16>,
    /// Negated dBov audio level.
    pub audio_level: Option<i8>,
    pub voice_activity: Option<bool>,
    pub video_orientation: Option<u8>,
    pub transmission_offset: Option<u32>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExtOffsets {
    pub abs_send_time: Option<usize>,
    pub transport_wide_cc01: Option<usize>,
}

impl RtpHeader {
    /// Parse the header of an RTP datagram. Returns `None` on anything
    /// malformed; the caller logs and drops.
    pub fn parse(buf: &[u8], ids: &ExtensionIds) -> Option<RtpHeader> {
        let orig_len = buf.len();
        if buf.len() < 12 {
            trace!("RTP header too short < 12: {}", buf.len());
            return None;
        }

        let version = (buf[0] & 0b1100_0000) >> 6;
        if version != 2 {
            trace!("RTP version is not 2");
            return None;
        }
        let has_padding = buf[0] & 0b0010_0000 > 0;
        let has_extension = buf[0] & 0b0001_0000 > 0;
        let csrc_count = (buf[0] & 0b0000_1111) as usize;
        let marker = buf[1] & 0b1000_0000 > 0;
        let payload_type = (buf[1] & 0b0111_1111).into();
        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut offset = 12 + 4 * csrc_count;
        if buf.len() < offset {
            trace!("RTP header invalid, not enough csrc");
            return None;
        }

        let mut ext_vals = ExtensionValues::default();
        let mut ext_offsets = ExtOffsets::default();

        if has_extension {
            if buf.len() < offset + 4 {
                trace!("RTP bad header extension");
                return None;
            }

            let profile = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let ext_words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let ext_start = offset + 4;
            let ext_len = ext_words * 4;

            if buf.len() < ext_start + ext_len {
                trace!("RTP ext len larger than packet");
                return None;
            }

            // RFC 8285: 0xBEDE is the one-byte form, 0x100x the two-byte
            // form. Anything else is an unknown profile we step over.
            if profile == 0xBEDE {
                parse_one_byte(
                    &buf[ext_start..ext_start + ext_len],
                    ext_start,
                    ids,
                    &mut ext_vals,
                    &mut ext_offsets,
                );
            } else if profile & 0xFFF0 == 0x1000 {
                parse_two_byte(
                    &buf[ext_start..ext_start + ext_len],
                    ext_start,
                    ids,
                    &mut ext_vals,
                    &mut ext_offsets,
                );
            } else {
                trace!("unknown RTP extension profile: {:#06x}", profile);
            }

            offset = ext_start + ext_len;
        }

        if offset > orig_len {
            return None;
        }

        Some(RtpHeader {
            version,
            has_padding,
            has_extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc: ssrc.into(),
            ext_vals,
            header_len: offset,
            ext_offsets,
        })
    }
}

fn parse_one_byte(
    mut buf: &[u8],
    mut abs: usize,
    ids: &ExtensionIds,
    ext_vals: &mut ExtensionValues,
    ext_offsets: &mut ExtOffsets,
) {
    while !buf.is_empty() {
        if buf[0] == 0 {
            // padding
            buf = &buf[1..];
            abs += 1;
            continue;
        }

        let id = buf[0] >> 4;
        let len = (buf[0] & 0xf) as usize + 1;

        if id == 15 {
            // Reserved, stop parsing.
            return;
        }

        if buf.len() < 1 + len {
            trace!("one-byte extension overshoots block");
            return;
        }

        apply_value(ids, id, &buf[1..1 + len], abs + 1, ext_vals, ext_offsets);

        buf = &buf[1 + len..];
        abs += 1 + len;
    }
}

fn parse_two_byte(
    mut buf: &[u8],
    mut abs: usize,
    ids: &ExtensionIds,
    ext_vals: &mut ExtensionValues,
    ext_offsets: &mut ExtOffsets,
) {
    while buf.len() >= 2 {
        if buf[0] == 0 {
            buf = &buf[1..];
            abs += 1;
            continue;
        }

        let id = buf[0];
        let len = buf[1] as usize;

        if buf.len() < 2 + len {
            trace!("two-byte extension overshoots block");
            return;
        }

        apply_value(ids, id, &buf[2..2 + len], abs + 2, ext_vals, ext_offsets);

        buf = &buf[2 + len..];
        abs += 2 + len;
    }
}

fn apply_value(
    ids: &ExtensionIds,
    id: u8,
    value: &[u8],
    value_offset: usize,
    ext_vals: &mut ExtensionValues,
    ext_offsets: &mut ExtOffsets,
) {
    let Some(uri) = ids.uri_of(id) else {
        return;
    };

    match uri {
        ExtensionUri::AbsSendTime => {
            if value.len() == 3 {
                ext_vals.abs_send_time =
                    Some(u32::from_be_bytes([0, value[0], value[1], value[2]]));
                ext_offsets.abs_send_time = Some(value_offset);
            }
        }
        ExtensionUri::TransportWideCc01 => {
            if value.len() == 2 {
                ext_vals.transport_cc = Some(u16::from_be_bytes([value[0], value[1]]));
                ext_offsets.transport_wide_cc01 = Some(value_offset);
            }
        }
        ExtensionUri::Mid => {
            if let Ok(s) = from_utf8(value) {
                ext_vals.mid = Some(s.into());
            }
        }
        ExtensionUri::Rid => {
            if let Ok(s) = from_utf8(value) {
                ext_vals.rid = Some(s.into());
            }
        }
        ExtensionUri::RepairedRid => {
            if let Ok(s) = from_utf8(value) {
                ext_vals.rrid = Some(s.into());
            }
        }
        ExtensionUri::SsrcAudioLevel => {
            if !value.is_empty() {
                ext_vals.audio_level = Some(-((value[0] & 0x7f) as i8));
                ext_vals.voice_activity = Some(value[0] & 0x80 > 0);
            }
        }
        ExtensionUri::VideoOrientation => {
            if !value.is_empty() {
                ext_vals.video_orientation = Some(value[0] & 0b11);
            }
        }
        ExtensionUri::Toffset => {
            if value.len() == 3 {
                ext_vals.transmission_offset =
                    Some(u32::from_be_bytes([0, value[0], value[1], value[2]]));
            }
        }
        ExtensionUri::FrameMarking => {
            // Recognised so that ids can be negotiated, value unused here.
        }
    }
}

/// "extend" a 16 bit sequence number into 64 bits by using the knowledge
/// of the previous such sequence number.
pub fn extend_u16(prev_ext_seq: Option<u64>, seq: u16) -> u64 {
    const MAX: u64 = 1 << 16;
    const HALF: u64 = MAX / 2;

    let seq = seq as u64;

    let Some(prev_index) = prev_ext_seq else {
        // No wrap-around so far.
        return seq;
    };

    let roc = (prev_index >> 16) as i64;
    let prev_seq = prev_index & (MAX - 1);

    let v = if prev_seq < HALF {
        if seq > HALF + prev_seq {
            (roc - 1) & (u64::MAX >> 16) as i64
        } else {
            roc
        }
    } else if prev_seq > seq + HALF {
        (roc + 1) & (u64::MAX >> 16) as i64
    } else {
        roc
    };

    if v < 0 {
        return 0;
    }

    (v as u64) * MAX + seq
}

#[cfg(test)]
mod test {
    use super::*;

    fn ids() -> ExtensionIds {
        ExtensionIds {
            mid: Some(4),
            abs_send_time: Some(2),
            transport_wide_cc01: Some(3),
            ssrc_audio_level: Some(1),
            ..Default::default()
        }
    }

    #[rustfmt::skip]
    fn packet() -> Vec<u8> {
        vec![
            0b1001_0000, 0x60, 0x00, 0x01,             // v=2, ext, marker, pt 96, seq 1
            0x00, 0x00, 0x00, 0x64,                    // timestamp 100
            0x11, 0x22, 0x33, 0x44,                    // ssrc
            0xBE, 0xDE, 0x00, 0x03,                    // one-byte form, 3 words
            0x22, 0xAA, 0xBB, 0xCC,                    // abs-send-time (id 2, 3 bytes)
            0x31, 0x00, 0x2A,                          // twcc (id 3, 2 bytes) = 42
            0x41, b'a', b'b', 0x00, 0x00,              // mid (id 4) = "ab", padding
            0xDE, 0xAD,                                // payload
        ]
    }

    #[test]
    fn parse_one_byte_extensions() {
        let buf = packet();
        let header = RtpHeader::parse(&buf, &ids()).unwrap();

        assert_eq!(header.sequence_number, 1);
        assert_eq!(header.timestamp, 100);
        assert_eq!(*header.ssrc, 0x11223344);
        assert!(header.marker);
        assert_eq!(*header.payload_type, 96);
        assert_eq!(header.ext_vals.abs_send_time, Some(0xAABBCC));
        assert_eq!(header.ext_vals.transport_cc, Some(42));
        assert_eq!(header.ext_vals.mid, Some("ab".into()));
        assert_eq!(header.header_len, 28);
        assert_eq!(&buf[header.header_len..], &[0xDE, 0xAD]);
    }

    #[test]
    fn ext_offsets_point_at_values() {
        let buf = packet();
        let header = RtpHeader::parse(&buf, &ids()).unwrap();

        let at = header.ext_offsets.abs_send_time.unwrap();
        assert_eq!(&buf[at..at + 3], &[0xAA, 0xBB, 0xCC]);

        let tcc = header.ext_offsets.transport_wide_cc01.unwrap();
        assert_eq!(&buf[tcc..tcc + 2], &[0x00, 0x2A]);
    }

    #[test]
    fn reject_bad_version() {
        let mut buf = packet();
        buf[0] = 0b0101_0000;
        assert!(RtpHeader::parse(&buf, &ids()).is_none());
    }

    #[test]
    fn reject_truncated_extension() {
        let mut buf = packet();
        buf[15] = 0x09; // claims 9 words of extensions
        assert!(RtpHeader::parse(&buf, &ids()).is_none());
    }

    #[test]
    fn extend_u16_wrap_around() {
        assert_eq!(extend_u16(None, 0), 0);
        assert_eq!(extend_u16(Some(0), 1), 1);
        assert_eq!(extend_u16(Some(65_535), 0), 65_536);
        assert_eq!(extend_u16(Some(65_500), 2), 65_538);
        assert_eq!(extend_u16(Some(2), 1), 1);
        assert_eq!(extend_u16(Some(65_538), 1), 65_537);
        assert_eq!(extend_u16(Some(3), 3), 3);
        assert_eq!(extend_u16(Some(65_500), 65_500), 65_500);
    }
}
