use std::collections::VecDeque;

use serde::Serialize;

use crate::channel::{ConsumeData, MediaKind, PreferredLayers, RequestError};
use crate::rate::RtpDataCounter;
use crate::rtcp::{
    CompoundPacket, Nack, ReceptionReport, ReportList, Sdes, SenderInfo, SenderReport,
    MAX_AUDIO_INTERVAL_MS, MAX_VIDEO_INTERVAL_MS,
};
use crate::rtp::{extend_u16, ExtensionIds, RtpPacket, Ssrc};

/// How many sent packets are kept around to serve NACKs.
const RETRANSMISSION_BUFFER_SIZE: usize = 512;

/// Send-side state of one subscription to a producer.
///
/// Forwards the producer's packets with rewritten SSRC and sequence
/// numbers, keeps a small history for retransmission, contributes sender
/// reports to the compound scheduler and digests the receiver reports
/// coming back from its endpoint.
#[derive(Debug)]
pub struct Consumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    ssrc: Ssrc,
    cname: Option<String>,
    paused: bool,
    producer_paused: bool,
    preferred_layers: Option<PreferredLayers>,

    /// Extended input sequence tracking, and where our own numbering
    /// started relative to it.
    input_base: Option<u64>,
    last_input: Option<u64>,
    output_base: u16,

    last_rtp_timestamp: u32,
    sent_counter: RtpDataCounter,
    retransmission_buffer: VecDeque<RtpPacket>,

    fraction_lost: u8,
    rtt_ms: f32,

    max_rtcp_interval: u64,
    last_rtcp_sent_at: u64,
}

impl Consumer {
    pub fn new(id: String, producer_id: String, data: ConsumeData) -> Result<Self, RequestError> {
        let params = &data.rtp_parameters;

        let ssrc = params
            .encodings
            .first()
            .and_then(|e| e.ssrc)
            .ok_or_else(|| RequestError::TypeError("missing encodings[0].ssrc".into()))?;

        let max_rtcp_interval = match data.kind {
            MediaKind::Audio => MAX_AUDIO_INTERVAL_MS,
            MediaKind::Video => MAX_VIDEO_INTERVAL_MS,
        };

        Ok(Consumer {
            id,
            producer_id,
            kind: data.kind,
            ssrc: ssrc.into(),
            cname: params.rtcp.cname.clone(),
            paused: data.paused,
            producer_paused: false,
            preferred_layers: None,
            input_base: None,
            last_input: None,
            output_base: rand::random::<u16>() % 32_768,
            last_rtp_timestamp: 0,
            sent_counter: RtpDataCounter::new(),
            retransmission_buffer: VecDeque::new(),
            fraction_lost: 0,
            rtt_ms: 0.0,
            max_rtcp_interval,
            last_rtcp_sent_at: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// The SSRC this consumer sends with; inbound RTCP feedback for it
    /// is routed here.
    pub fn media_ssrc(&self) -> Ssrc {
        self.ssrc
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_producer_paused(&self) -> bool {
        self.producer_paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn producer_paused(&mut self) {
        self.producer_paused = true;
    }

    pub fn producer_resumed(&mut self) {
        self.producer_paused = false;
    }

    pub fn set_preferred_layers(&mut self, layers: PreferredLayers) {
        self.preferred_layers = Some(layers);
    }

    pub fn preferred_layers(&self) -> Option<PreferredLayers> {
        self.preferred_layers
    }

    /// Loss its endpoint last reported, for the worst-remote query.
    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    pub fn rtt_ms(&self) -> f32 {
        self.rtt_ms
    }

    pub fn score(&self) -> u8 {
        10_u8.saturating_sub((self.fraction_lost as f64 / 25.5).round() as u8)
    }

    /// The transport (re)connected; video consumers need a fresh key
    /// frame from their producer to start cleanly.
    pub fn transport_connected(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Forward one packet republished by the bound producer. Returns the
    /// rewritten packet to transmit, or `None` while paused.
    pub fn send_rtp_packet(
        &mut self,
        buf: &[u8],
        ids: &ExtensionIds,
        now_ms: u64,
    ) -> Option<RtpPacket> {
        if self.paused || self.producer_paused {
            return None;
        }

        let mut packet = match RtpPacket::parse(buf.to_vec(), ids) {
            Some(v) => v,
            None => {
                warn!("dropping unparseable packet on consumer {}", self.id);
                return None;
            }
        };

        let input = extend_u16(self.last_input, packet.sequence_number());
        self.last_input = Some(input);
        let base = *self.input_base.get_or_insert(input);

        let out_seq = self
            .output_base
            .wrapping_add(input.wrapping_sub(base) as u16);

        packet.set_ssrc(self.ssrc);
        packet.set_sequence_number(out_seq);

        self.last_rtp_timestamp = packet.timestamp();
        self.sent_counter.update(packet.len(), now_ms);

        if self.retransmission_buffer.len() == RETRANSMISSION_BUFFER_SIZE {
            self.retransmission_buffer.pop_front();
        }
        self.retransmission_buffer.push_back(packet.clone());

        Some(packet)
    }

    /// Serve a NACK from the retransmission buffer.
    pub fn receive_nack(&mut self, nack: &Nack) -> Vec<RtpPacket> {
        let mut out = Vec::new();

        for seq in nack.lost_seqs() {
            let found = self
                .retransmission_buffer
                .iter()
                .find(|p| p.sequence_number() == seq);

            match found {
                Some(packet) => out.push(packet.clone()),
                None => trace!(
                    "cannot retransmit seq {} for consumer {}, not in buffer",
                    seq,
                    self.id
                ),
            }
        }

        out
    }

    /// Digest a receiver report for our SSRC. Returns the round trip
    /// time when it is computable from LSR/DLSR.
    pub fn receive_rtcp_receiver_report(
        &mut self,
        report: &ReceptionReport,
        now_ms: u64,
    ) -> Option<f32> {
        self.fraction_lost = report.fraction_lost;

        if report.last_sr_time == 0 {
            return None;
        }

        // RFC 3550 6.4.1: RTT = now - DLSR - LSR, all in middle-32 NTP.
        let now = ntp_mid32(now_ms);
        let rtt = now
            .checked_sub(report.last_sr_delay)?
            .checked_sub(report.last_sr_time)?;

        let rtt_ms = (rtt >> 16) as f32 * 1000.0 + ((rtt & 0xFFFF) as f32 / 65_536.0) * 1000.0;
        self.rtt_ms = rtt_ms;

        Some(rtt_ms)
    }

    /// Contribute a sender report (plus CNAME) to the compound packet,
    /// at most once per RTCP interval.
    pub fn get_rtcp(&mut self, packet: &mut CompoundPacket, now_ms: u64) -> bool {
        let elapsed = now_ms.saturating_sub(self.last_rtcp_sent_at);
        if (elapsed as f64 * 1.15) < self.max_rtcp_interval as f64 {
            return false;
        }
        self.last_rtcp_sent_at = now_ms;

        if self.sent_counter.packet_count() == 0 {
            return false;
        }

        let (ntp_seconds, ntp_fraction) = ms_to_ntp(now_ms);

        packet.add_sender_report(SenderReport {
            sender_info: SenderInfo {
                ssrc: self.ssrc,
                ntp_seconds,
                ntp_fraction,
                rtp_timestamp: self.last_rtp_timestamp,
                sender_packet_count: self.sent_counter.packet_count() as u32,
                sender_octet_count: self.sent_counter.bytes() as u32,
            },
            reports: ReportList::new(),
        });

        if let Some(cname) = &self.cname {
            packet.add_sdes_chunk(Sdes::cname(self.ssrc, cname));
        }

        true
    }

    pub fn transmission_rate(&mut self, now_ms: u64) -> u32 {
        self.sent_counter.get_bitrate(now_ms)
    }

    pub fn dump(&self) -> ConsumerDump {
        ConsumerDump {
            id: self.id.clone(),
            producer_id: self.producer_id.clone(),
            kind: self.kind,
            paused: self.paused,
            producer_paused: self.producer_paused,
            ssrc: *self.ssrc,
            preferred_layers: self.preferred_layers,
        }
    }

    pub fn get_stats(&mut self, now_ms: u64) -> ConsumerStat {
        ConsumerStat {
            ssrc: *self.ssrc,
            packet_count: self.sent_counter.packet_count(),
            byte_count: self.sent_counter.bytes(),
            bitrate: self.sent_counter.get_bitrate(now_ms),
            fraction_lost: self.fraction_lost,
            rtt_ms: self.rtt_ms,
            score: self.score(),
        }
    }
}

/// NTP timestamp parts for a monotonic millisecond clock.
fn ms_to_ntp(now_ms: u64) -> (u32, u32) {
    let seconds = (now_ms / 1000) as u32;
    let fraction = (((now_ms % 1000) << 32) / 1000) as u32;
    (seconds, fraction)
}

/// The middle 32 bits of the NTP timestamp for `now_ms`.
fn ntp_mid32(now_ms: u64) -> u32 {
    let (seconds, fraction) = ms_to_ntp(now_ms);
    (seconds << 16) | (fraction >> 16)
}

/// Dump DTO sent over the control channel.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDump {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub paused: bool,
    pub producer_paused: bool,
    pub ssrc: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_layers: Option<PreferredLayers>,
}

/// Stats DTO.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStat {
    pub ssrc: u32,
    pub packet_count: u64,
    pub byte_count: u64,
    pub bitrate: u32,
    pub fraction_lost: u8,
    pub rtt_ms: f32,
    pub score: u8,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::{EncodingData, RtpParametersData};
    use crate::rtcp::NackEntry;

    fn consume_data(ssrc: u32) -> ConsumeData {
        ConsumeData {
            kind: MediaKind::Video,
            paused: false,
            rtp_parameters: RtpParametersData {
                mid: None,
                encodings: vec![EncodingData {
                    ssrc: Some(ssrc),
                    rid: None,
                    rtx: None,
                }],
                header_extensions: vec![],
                rtcp: crate::channel::RtcpParametersData {
                    cname: Some("consumer-cname".into()),
                },
            },
        }
    }

    fn consumer(ssrc: u32) -> Consumer {
        Consumer::new("c1".into(), "p1".into(), consume_data(ssrc)).unwrap()
    }

    fn media_packet(ssrc: u32, seq: u16, timestamp: u32) -> Vec<u8> {
        let mut buf = vec![
            0b1000_0000, 96, 0, 0, // v2, pt 96
            0, 0, 0, 0, // timestamp
            0, 0, 0, 0, // ssrc
            1, 2, 3, 4, // payload
        ];
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[4..8].copy_from_slice(&timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        buf
    }

    #[test]
    fn rewrites_ssrc_and_sequence() {
        let mut consumer = consumer(0xAA);
        let ids = ExtensionIds::default();

        let first = consumer
            .send_rtp_packet(&media_packet(1111, 100, 0), &ids, 0)
            .unwrap();
        let second = consumer
            .send_rtp_packet(&media_packet(1111, 101, 20), &ids, 20)
            .unwrap();

        assert_eq!(*first.ssrc(), 0xAA);
        assert_eq!(*second.ssrc(), 0xAA);
        assert_eq!(
            second.sequence_number(),
            first.sequence_number().wrapping_add(1)
        );
    }

    #[test]
    fn sequence_rewrite_follows_gaps() {
        let mut consumer = consumer(0xAA);
        let ids = ExtensionIds::default();

        let first = consumer
            .send_rtp_packet(&media_packet(1111, 100, 0), &ids, 0)
            .unwrap();
        let third = consumer
            .send_rtp_packet(&media_packet(1111, 103, 60), &ids, 60)
            .unwrap();

        assert_eq!(
            third.sequence_number(),
            first.sequence_number().wrapping_add(3)
        );
    }

    #[test]
    fn paused_consumer_sends_nothing() {
        let mut consumer = consumer(0xAA);
        consumer.pause();

        let ids = ExtensionIds::default();
        assert!(consumer
            .send_rtp_packet(&media_packet(1111, 100, 0), &ids, 0)
            .is_none());

        consumer.resume();
        consumer.producer_paused();
        assert!(consumer
            .send_rtp_packet(&media_packet(1111, 101, 0), &ids, 0)
            .is_none());
    }

    #[test]
    fn nack_served_from_retransmission_buffer() {
        let mut consumer = consumer(0xAA);
        let ids = ExtensionIds::default();

        let mut sent = Vec::new();
        for i in 0..5_u16 {
            let p = consumer
                .send_rtp_packet(&media_packet(1111, 100 + i, i as u32 * 20), &ids, i as u64)
                .unwrap();
            sent.push(p.sequence_number());
        }

        let nack = Nack {
            sender_ssrc: 0.into(),
            ssrc: 0xAA.into(),
            reports: NackEntry {
                pid: sent[1],
                blp: 0b1,
            }
            .into(),
        };

        let retransmit = consumer.receive_nack(&nack);
        assert_eq!(retransmit.len(), 2);
        assert_eq!(retransmit[0].sequence_number(), sent[1]);
        assert_eq!(retransmit[1].sequence_number(), sent[2]);
    }

    #[test]
    fn sender_report_after_sending() {
        let mut consumer = consumer(0xAA);
        let ids = ExtensionIds::default();

        // Nothing sent: no SR.
        let mut compound = CompoundPacket::new();
        assert!(!consumer.get_rtcp(&mut compound, 10_000));

        consumer
            .send_rtp_packet(&media_packet(1111, 100, 0), &ids, 10_100)
            .unwrap();

        let mut compound = CompoundPacket::new();
        assert!(consumer.get_rtcp(&mut compound, 20_000));
        assert!(compound.has_sender_report());
    }

    #[test]
    fn rtt_from_receiver_report() {
        let mut consumer = consumer(0xAA);

        // The remote echoes the middle NTP bits of our SR at t=1000 and
        // claims half a second of processing delay.
        let report = ReceptionReport {
            ssrc: 0xAA.into(),
            fraction_lost: 10,
            packets_lost: 0,
            max_seq: 100,
            jitter: 0,
            last_sr_time: ntp_mid32(1000),
            last_sr_delay: 32_768,
        };

        let rtt = consumer.receive_rtcp_receiver_report(&report, 2000).unwrap();
        assert!((rtt - 500.0).abs() < 1.0);
        assert_eq!(consumer.fraction_lost(), 10);
    }
}
