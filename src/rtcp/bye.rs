use std::str::from_utf8;

use crate::rtp::Ssrc;

use super::{pad_bytes_to_word, FeedbackMessageType, ReportList, RtcpHeader, RtcpPacket, RtcpType};

/// RTCP BYE. A member leaving the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    /// The SSRC that are no longer in use.
    pub reports: ReportList<Ssrc>,
    /// Optional reason for leaving.
    pub reason: Option<String>,
}

impl RtcpPacket for Goodbye {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::Goodbye,
            feedback_message_type: FeedbackMessageType::SourceCount(self.reports.len() as u8),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // each ssrc is one word, the reason is length prefixed and padded
        let reason_words = self
            .reason
            .as_ref()
            .map(|r| pad_bytes_to_word(1 + r.len()) / 4)
            .unwrap_or(0);
        1 + self.reports.len() + reason_words
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(&mut buf[..4]);
        let mut offset = 4;
        for s in self.reports.iter() {
            buf[offset..offset + 4].copy_from_slice(&s.to_be_bytes());
            offset += 4;
        }

        if let Some(reason) = &self.reason {
            let bytes = reason.as_bytes();
            buf[offset] = bytes.len() as u8;
            buf[offset + 1..offset + 1 + bytes.len()].copy_from_slice(bytes);
            let padded = pad_bytes_to_word(1 + bytes.len());
            for i in 1 + bytes.len()..padded {
                buf[offset + i] = 0;
            }
            offset += padded;
        }

        offset
    }
}

impl<'a> TryFrom<(usize, &'a [u8])> for Goodbye {
    type Error = &'static str;

    fn try_from((count, buf): (usize, &'a [u8])) -> Result<Self, Self::Error> {
        let mut reports = ReportList::new();
        let mut buf = buf;

        if buf.len() < count * 4 {
            return Err("Less than count * 4 bytes for Goodbye");
        }

        let max = count.min(31);

        for _ in 0..max {
            let ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
            reports.push(ssrc);
            buf = &buf[4..];
        }

        let mut reason = None;
        if !buf.is_empty() {
            let len = buf[0] as usize;
            if buf.len() >= 1 + len {
                if let Ok(s) = from_utf8(&buf[1..1 + len]) {
                    reason = Some(s.to_string());
                }
            }
        }

        Ok(Goodbye { reports, reason })
    }
}
