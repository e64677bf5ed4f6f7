use crate::rtp::Ssrc;

use super::{FeedbackMessageType, ReportList, RtcpHeader, RtcpPacket, RtcpType, TransportType};

/// Negative acknowledgement of lost RTP packets.
///
/// Flows in both directions through the router: producers get one
/// generated whenever their receive stream shows a gap, and consumers
/// answer incoming ones by retransmitting from their send history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    /// Sender of this feedback. Mostly irrelevant, but part of RTCP packets.
    pub sender_ssrc: Ssrc,
    /// The stream the losses belong to.
    pub ssrc: Ssrc,
    /// Loss ranges, 17 sequence numbers per entry.
    pub reports: ReportList<NackEntry>,
}

/// One lost packet id plus a bitmask covering the 16 following ones.
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Default, Clone, Copy)]
pub struct NackEntry {
    pub pid: u16,
    pub blp: u16,
}

impl Nack {
    /// Pack missing sequence numbers into as few entries as possible.
    ///
    /// `missing` must be in send order (ascending modulo wrap). Returns
    /// `None` for an empty list. At most 31 entries are representable in
    /// one packet; anything beyond that is silently capped, the next gap
    /// report will cover it.
    pub fn from_missing(ssrc: Ssrc, missing: &[u16]) -> Option<Nack> {
        let mut entries: Vec<NackEntry> = Vec::new();

        for seq in missing {
            match entries.last_mut() {
                Some(entry) if seq.wrapping_sub(entry.pid) <= 16 && *seq != entry.pid => {
                    entry.blp |= 1 << (seq.wrapping_sub(entry.pid) - 1);
                }
                _ => entries.push(NackEntry { pid: *seq, blp: 0 }),
            }
        }

        if entries.is_empty() {
            return None;
        }

        let mut reports = ReportList::new();
        for entry in entries.into_iter().take(31) {
            reports.push(entry);
        }

        Some(Nack {
            sender_ssrc: 0.into(),
            ssrc,
            reports,
        })
    }

    /// Every sequence number this NACK reports as lost.
    pub fn lost_seqs(&self) -> impl Iterator<Item = u16> + '_ {
        self.reports.iter().flat_map(|entry| entry.iter_lost())
    }
}

impl NackEntry {
    /// The pid plus whichever of the 16 mask positions are set.
    pub fn iter_lost(&self) -> impl Iterator<Item = u16> {
        let pid = self.pid;
        let blp = self.blp;

        std::iter::once(pid).chain(
            (0..16_u16)
                .filter(move |bit| blp & (1 << bit) != 0)
                .map(move |bit| pid.wrapping_add(bit + 1)),
        )
    }
}

impl RtcpPacket for Nack {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::TransportLayerFeedback,
            feedback_message_type: FeedbackMessageType::TransportFeedback(TransportType::Nack),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header + sender SSRC + media SSRC + one word per entry
        1 + 2 + self.reports.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        let mut offset = 12;
        for entry in &self.reports {
            buf[offset..offset + 2].copy_from_slice(&entry.pid.to_be_bytes());
            buf[offset + 2..offset + 4].copy_from_slice(&entry.blp.to_be_bytes());
            offset += 4;
        }

        offset
    }
}

impl<'a> TryFrom<&'a [u8]> for Nack {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 12 {
            return Err("Nack less than 12 bytes");
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]).into();

        let mut reports = ReportList::new();

        let mut offset = 8;
        while buf.len() - offset >= 4 && !reports.is_full() {
            let pid = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let blp = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]);
            reports.push(NackEntry { pid, blp });
            offset += 4;
        }

        Ok(Nack {
            sender_ssrc,
            ssrc,
            reports,
        })
    }
}
