use crate::rtp::Ssrc;

use super::{FeedbackMessageType, RtcpType};
use super::{ReceptionReport, ReportList, RtcpHeader, RtcpPacket};

/// A report of packets sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    /// Information about the sender of this report.
    pub sender_info: SenderInfo,
    /// A sender report is implicitly also a receiver report. This
    /// might hold data that would otherwise come in a separate RR.
    pub reports: ReportList<ReceptionReport>,
}

/// Information about a stream being sent.
///
/// See [RFC 3550 6.4.1](https://www.rfc-editor.org/rfc/rfc3550#section-6.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderInfo {
    /// The SSRC of the SR originator.
    pub ssrc: Ssrc,
    /// Seconds part of the 64 bit NTP timestamp.
    pub ntp_seconds: u32,
    /// Fraction part of the 64 bit NTP timestamp.
    pub ntp_fraction: u32,
    /// The RTP timestamp corresponding to the same instant as the NTP
    /// timestamp above, in the stream's media clock.
    pub rtp_timestamp: u32,
    /// Total packets the sender had sent when this was generated.
    pub sender_packet_count: u32,
    /// Total payload octets the sender had sent when this was generated.
    pub sender_octet_count: u32,
}

impl SenderInfo {
    /// The middle 32 bits of the NTP timestamp, as echoed back in the
    /// LSR field of reception reports.
    pub fn lsr(&self) -> u32 {
        (self.ntp_seconds << 16) | (self.ntp_fraction >> 16)
    }
}

impl RtcpPacket for SenderReport {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::SenderReport,
            feedback_message_type: FeedbackMessageType::ReceptionReport(self.reports.len() as u8),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // * header: 1
        // * sender info: 6
        // * reports: x 6
        1 + 6 + 6 * self.reports.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);

        self.sender_info.write_to(&mut buf[4..]);

        let mut offset = 28;
        for report in &self.reports {
            report.write_to(&mut buf[offset..]);
            offset += 24;
        }

        offset
    }
}

impl SenderInfo {
    fn write_to(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[4..8].copy_from_slice(&self.ntp_seconds.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ntp_fraction.to_be_bytes());
        buf[12..16].copy_from_slice(&self.rtp_timestamp.to_be_bytes());
        buf[16..20].copy_from_slice(&self.sender_packet_count.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sender_octet_count.to_be_bytes());
    }
}

impl<'a> TryFrom<&'a [u8]> for SenderReport {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        let sender_info = buf.try_into()?;

        let mut reports = ReportList::new();
        let mut buf = &buf[24..];

        let count = buf.len() / 24;

        let max = count.min(31);

        for _ in 0..max {
            let report = buf.try_into()?;
            reports.push(report);
            buf = &buf[24..];
        }

        Ok(SenderReport {
            sender_info,
            reports,
        })
    }
}

impl<'a> TryFrom<&'a [u8]> for SenderInfo {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 24 {
            return Err("Less than 24 bytes for SenderInfo");
        }

        // Sender report shape is here
        // https://www.rfc-editor.org/rfc/rfc3550#section-6.4.1

        let ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
        let ntp_seconds = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ntp_fraction = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let rtp_timestamp = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let sender_packet_count = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let sender_octet_count = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);

        Ok(SenderInfo {
            ssrc,
            ntp_seconds,
            ntp_fraction,
            rtp_timestamp,
            sender_packet_count,
            sender_octet_count,
        })
    }
}
