use crate::rtp::Ssrc;

use super::{FeedbackMessageType, PayloadType, ReportList, RtcpHeader, RtcpPacket, RtcpType};

/// Full Intra Request.
///
/// The heavyweight sibling of PLI: a full decoder refresh, one FCI entry
/// per stream. The router treats every entry like a PLI for that SSRC
/// and fans it out to the producing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fir {
    /// Sender of this feedback. Mostly irrelevant, but part of RTCP packets.
    pub sender_ssrc: Ssrc,
    /// One entry per stream needing a refresh.
    pub entries: ReportList<FirEntry>,
}

/// One stream needing a full decoder refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirEntry {
    /// The stream to refresh.
    pub ssrc: Ssrc,
    /// Request counter, so retransmitted FIRs are not taken as new
    /// requests.
    pub serial: u8,
}

impl Fir {
    /// The streams this FIR asks a refresh for.
    pub fn ssrcs(&self) -> impl Iterator<Item = Ssrc> + '_ {
        self.entries.iter().map(|entry| entry.ssrc)
    }
}

impl RtcpPacket for Fir {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::PayloadSpecificFeedback,
            feedback_message_type: FeedbackMessageType::PayloadFeedback(
                PayloadType::FullIntraRequest,
            ),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header + sender SSRC + media SSRC (zero by RFC 5104) + two
        // words per FCI entry
        1 + 1 + 1 + self.entries.len() * 2
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        // Media SSRC is unused for FIR; the targets are in the FCI.
        buf[8..12].fill(0);

        let mut offset = 12;
        for entry in &self.entries {
            buf[offset..offset + 4].copy_from_slice(&entry.ssrc.to_be_bytes());
            buf[offset + 4] = entry.serial;
            buf[offset + 5..offset + 8].fill(0);
            offset += 8;
        }

        offset
    }
}

impl<'a> TryFrom<&'a [u8]> for Fir {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 16 {
            return Err("Fir less than 16 bytes");
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();

        let mut entries = ReportList::new();

        let mut offset = 8;
        while buf.len() - offset >= 8 && !entries.is_full() {
            let ssrc = u32::from_be_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ])
            .into();
            let serial = buf[offset + 4];
            entries.push(FirEntry { ssrc, serial });
            offset += 8;
        }

        Ok(Fir {
            sender_ssrc,
            entries,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn refresh_request_roundtrip() {
        let mut entries = ReportList::new();
        entries.push(FirEntry {
            ssrc: 0xAA.into(),
            serial: 1,
        });
        entries.push(FirEntry {
            ssrc: 0xAB.into(),
            serial: 7,
        });

        let fir = Fir {
            sender_ssrc: 9.into(),
            entries,
        };

        let mut buf = vec![0; 64];
        let n = fir.write_to(&mut buf);
        assert_eq!(n, fir.length_words() * 4);
        buf.truncate(n);

        // fmt 4, type 206, 7 words.
        assert_eq!(&buf[..4], &[0x84, 206, 0, 6]);

        let parsed = Fir::try_from(&buf[4..]).unwrap();
        assert_eq!(parsed, fir);

        let targets: Vec<Ssrc> = parsed.ssrcs().collect();
        assert_eq!(targets, vec![0xAA.into(), 0xAB.into()]);
    }

    #[test]
    fn fir_without_entries_is_an_error() {
        // Sender + media SSRC only: no FCI to act on.
        let short = [0u8; 8];
        assert!(Fir::try_from(short.as_slice()).is_err());
    }
}
