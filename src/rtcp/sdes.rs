use std::str::from_utf8;

use crate::rtp::Ssrc;

use super::{pad_bytes_to_word, FeedbackMessageType, RtcpHeader, RtcpPacket, RtcpType};

/// End-of-item-list marker, doubling as the padding octet.
const END: u8 = 0;

/// Source descriptions (SDES): one chunk of items per SSRC.
///
/// The router emits these with a single CNAME item per sending stream,
/// and on the inbound side only uses the chunk SSRC to check the source
/// is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptions {
    /// The per-source chunks. The RTCP count field caps this at 31.
    pub chunks: Vec<Sdes>,
}

/// Description items of a single source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdes {
    pub ssrc: Ssrc,
    pub items: Vec<(SdesType, String)>,
}

/// Item types defined in RFC 3550 6.5. Anything else is skipped on
/// parse.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum SdesType {
    /// Canonical endpoint identifier.
    CNAME = 1,
    /// User name.
    NAME = 2,
    /// Email address.
    EMAIL = 3,
    /// Phone number.
    PHONE = 4,
    /// Geographic location.
    LOC = 5,
    /// Application or tool name.
    TOOL = 6,
    /// Notice about the source.
    NOTE = 7,
    /// Private extensions.
    PRIV = 8,
}

impl SdesType {
    fn from_u8(v: u8) -> Option<SdesType> {
        use SdesType::*;
        match v {
            1 => Some(CNAME),
            2 => Some(NAME),
            3 => Some(EMAIL),
            4 => Some(PHONE),
            5 => Some(LOC),
            6 => Some(TOOL),
            7 => Some(NOTE),
            8 => Some(PRIV),
            _ => None,
        }
    }
}

impl Sdes {
    /// The chunk shape the router sends: one CNAME item.
    pub fn cname(ssrc: Ssrc, value: &str) -> Sdes {
        Sdes {
            ssrc,
            items: vec![(SdesType::CNAME, value.to_string())],
        }
    }

    /// Bytes this chunk takes on the wire, end marker and word padding
    /// included.
    fn wire_len(&self) -> usize {
        let items: usize = self.items.iter().map(|(_, v)| 2 + v.len()).sum();
        pad_bytes_to_word(4 + items + 1)
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        buf[..4].copy_from_slice(&self.ssrc.to_be_bytes());

        let mut offset = 4;
        for (kind, value) in &self.items {
            let bytes = value.as_bytes();
            buf[offset] = *kind as u8;
            buf[offset + 1] = bytes.len() as u8;
            buf[offset + 2..offset + 2 + bytes.len()].copy_from_slice(bytes);
            offset += 2 + bytes.len();
        }

        // End marker, then zero octets up to the next word boundary.
        let end = pad_bytes_to_word(offset + 1);
        buf[offset..end].fill(END);

        end
    }

    /// Parse one chunk, returning it together with the number of bytes
    /// it occupied (so the caller can step to the next chunk even when
    /// items were skipped).
    fn parse(buf: &[u8]) -> Result<(Sdes, usize), &'static str> {
        if buf.len() < 8 {
            return Err("Sdes chunk shorter than 8 bytes");
        }

        let ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
        let mut items = Vec::new();

        let mut pos = 4;
        loop {
            if pos >= buf.len() {
                return Err("Sdes chunk without end marker");
            }

            let kind = buf[pos];
            if kind == END {
                break;
            }

            if pos + 2 > buf.len() {
                return Err("Sdes item header overshoots chunk");
            }
            let len = buf[pos + 1] as usize;
            if pos + 2 + len > buf.len() {
                return Err("Sdes item value overshoots chunk");
            }

            let value = &buf[pos + 2..pos + 2 + len];
            match (SdesType::from_u8(kind), from_utf8(value)) {
                (Some(kind), Ok(value)) => items.push((kind, value.to_string())),
                _ => trace!("skipping sdes item of type {}", kind),
            }

            pos += 2 + len;
        }

        // `pos` sits on the end marker; the chunk runs to the next word
        // boundary. A trailing END without its padding is tolerated.
        let consumed = pad_bytes_to_word(pos + 1).min(buf.len());

        Ok((Sdes { ssrc, items }, consumed))
    }
}

impl RtcpPacket for Descriptions {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::SourceDescription,
            feedback_message_type: FeedbackMessageType::SourceCount(self.chunks.len() as u8),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        1 + self.chunks.iter().map(|c| c.wire_len()).sum::<usize>() / 4
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);

        let mut offset = 4;
        for chunk in &self.chunks {
            offset += chunk.write_to(&mut buf[offset..]);
        }

        offset
    }
}

impl<'a> TryFrom<&'a [u8]> for Descriptions {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        let mut chunks = Vec::new();

        let mut pos = 0;
        // Some clients append a spurious [0,0,0,0] after the last chunk;
        // anything shorter than a minimal chunk is ignored.
        while buf.len() - pos >= 8 && chunks.len() < 31 {
            let (chunk, consumed) = Sdes::parse(&buf[pos..])?;
            chunks.push(chunk);
            pos += consumed;
        }

        Ok(Descriptions { chunks })
    }
}

impl<'a> TryFrom<&'a [u8]> for Sdes {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        Sdes::parse(buf).map(|(chunk, _)| chunk)
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use super::super::Rtcp;
    use super::*;

    #[test]
    fn cname_chunk_roundtrip() {
        let chunk = Sdes::cname(0xAA.into(), "consumer-cname");

        let mut buf = vec![0; 64];
        let n = chunk.write_to(&mut buf);
        assert_eq!(n, chunk.wire_len());
        buf.truncate(n);

        let parsed = Sdes::try_from(buf.as_slice()).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn write_matches_wire_len_across_value_sizes() {
        let mut buf = vec![0; 512];

        for len in [0, 1, 2, 3, 4, 30, 253] {
            let chunk = Sdes::cname(1.into(), &"c".repeat(len));
            assert_eq!(chunk.write_to(&mut buf), chunk.wire_len());
            assert_eq!(chunk.wire_len() % 4, 0);
        }
    }

    #[test]
    fn descriptions_roundtrip_through_compound() {
        let sdes = Descriptions {
            chunks: vec![
                Sdes::cname(0xAA.into(), "consumer-cname"),
                Sdes::cname(0xAB.into(), "other-endpoint"),
            ],
        };

        let mut queue = VecDeque::new();
        queue.push_back(Rtcp::SourceDescription(sdes.clone()));

        let mut buf = vec![0; 256];
        let n = Rtcp::write_packet(&mut queue, &mut buf);
        buf.truncate(n);

        let mut parsed = VecDeque::new();
        Rtcp::read_packet(&buf, &mut parsed);

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], Rtcp::SourceDescription(sdes));
    }

    #[test]
    fn unknown_item_type_is_skipped() {
        #[rustfmt::skip]
        let buf = [
            0, 0, 0, 9,             // ssrc
            9, 2, b'x', b'x',       // unrecognised item type
            1, 2, b'a', b'b',       // cname "ab"
            0, 0, 0, 0,             // end + padding
        ];

        let (chunk, consumed) = Sdes::parse(&buf).unwrap();
        assert_eq!(consumed, 16);
        assert_eq!(*chunk.ssrc, 9);
        assert_eq!(chunk.items, vec![(SdesType::CNAME, "ab".to_string())]);
    }

    #[test]
    fn overshooting_value_is_an_error() {
        let buf = [
            0, 0, 0, 9, // ssrc
            1, 200, b'x', b'y', // claims 200 bytes of value
        ];

        assert!(Sdes::parse(&buf).is_err());
    }

    #[test]
    fn chunk_without_end_marker_is_an_error() {
        let buf = [
            0, 0, 0, 9, // ssrc
            1, 2, b'a', b'b', // item, then the buffer just stops
        ];

        assert!(Sdes::parse(&buf).is_err());
    }
}
