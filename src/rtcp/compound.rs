use super::{
    Descriptions, ReceiverReport, ReceptionReport, ReportList, RtcpPacket, Sdes, SenderReport,
};

/// One compound RTCP packet under construction.
///
/// The transport's RTCP scheduler asks every consumer and producer to
/// contribute, then serializes everything back-to-back into a single
/// datagram: sender reports first (they carry the SSRC SRTCP needs),
/// then receiver reports, then source descriptions.
#[derive(Debug, Default)]
pub struct CompoundPacket {
    sender_reports: Vec<SenderReport>,
    receiver_reports: Vec<ReceptionReport>,
    sdes_chunks: Vec<Sdes>,
}

impl CompoundPacket {
    pub fn new() -> Self {
        CompoundPacket::default()
    }

    pub fn add_sender_report(&mut self, report: SenderReport) {
        self.sender_reports.push(report);
    }

    pub fn add_receiver_report(&mut self, report: ReceptionReport) {
        self.receiver_reports.push(report);
    }

    pub fn add_sdes_chunk(&mut self, chunk: Sdes) {
        self.sdes_chunks.push(chunk);
    }

    pub fn has_sender_report(&self) -> bool {
        !self.sender_reports.is_empty()
    }

    pub fn receiver_report_count(&self) -> usize {
        self.receiver_reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender_reports.is_empty()
            && self.receiver_reports.is_empty()
            && self.sdes_chunks.is_empty()
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.as_packets()
            .iter()
            .map(|p| p.length_words() * 4)
            .sum()
    }

    /// Serialize into `buf`, returning the bytes written.
    ///
    /// Panics if `buf` is smaller than [`CompoundPacket::size`]; the
    /// caller checks against the RTCP buffer size first.
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        let mut offset = 0;
        for packet in self.as_packets() {
            offset += packet.write_to(&mut buf[offset..]);
        }
        offset
    }

    fn as_packets(&self) -> Vec<Box<dyn RtcpPacket>> {
        let mut packets: Vec<Box<dyn RtcpPacket>> = Vec::new();

        for sr in &self.sender_reports {
            packets.push(Box::new(sr.clone()));
        }

        // Chunk reception reports into RRs of max 31.
        for chunk in self.receiver_reports.chunks(31) {
            let mut reports = ReportList::new();
            for r in chunk {
                reports.push(*r);
            }
            packets.push(Box::new(ReceiverReport {
                sender_ssrc: 0.into(),
                reports,
            }));
        }

        if !self.sdes_chunks.is_empty() {
            packets.push(Box::new(Descriptions {
                chunks: self.sdes_chunks.iter().take(31).cloned().collect(),
            }));
        }

        packets
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use super::super::{Rtcp, SenderInfo};
    use super::*;

    fn reception_report(ssrc: u32) -> ReceptionReport {
        ReceptionReport {
            ssrc: ssrc.into(),
            fraction_lost: 0,
            packets_lost: 0,
            max_seq: 100,
            jitter: 0,
            last_sr_time: 0,
            last_sr_delay: 0,
        }
    }

    #[test]
    fn sender_report_first() {
        let mut compound = CompoundPacket::new();

        compound.add_receiver_report(reception_report(0xAA));
        compound.add_sender_report(SenderReport {
            sender_info: SenderInfo {
                ssrc: 0xBB.into(),
                ntp_seconds: 100,
                ntp_fraction: 0,
                rtp_timestamp: 0,
                sender_packet_count: 1,
                sender_octet_count: 2,
            },
            reports: ReportList::new(),
        });

        assert!(compound.has_sender_report());
        assert_eq!(compound.receiver_report_count(), 1);

        let mut buf = vec![0; 256];
        let n = compound.serialize(&mut buf);
        assert_eq!(n, compound.size());
        buf.truncate(n);

        let mut parsed = VecDeque::new();
        Rtcp::read_packet(&buf, &mut parsed);

        assert_eq!(parsed.len(), 2);
        assert!(matches!(parsed[0], Rtcp::SenderReport(_)));
        assert!(matches!(parsed[1], Rtcp::ReceiverReport(_)));
    }

    #[test]
    fn receiver_reports_chunk_at_31() {
        let mut compound = CompoundPacket::new();
        for i in 0..40 {
            compound.add_receiver_report(reception_report(i));
        }

        let mut buf = vec![0; 2048];
        let n = compound.serialize(&mut buf);
        buf.truncate(n);

        let mut parsed = VecDeque::new();
        Rtcp::read_packet(&buf, &mut parsed);

        assert_eq!(parsed.len(), 2);
        let Rtcp::ReceiverReport(first) = &parsed[0] else {
            panic!("not a receiver report");
        };
        let Rtcp::ReceiverReport(second) = &parsed[1] else {
            panic!("not a receiver report");
        };
        assert_eq!(first.reports.len(), 31);
        assert_eq!(second.reports.len(), 9);
    }
}
