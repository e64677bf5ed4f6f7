use std::collections::HashMap;

use serde::Serialize;

use crate::channel::{MediaKind, ProduceData, RequestError};
use crate::keyframe::KeyFrameRequestManager;
use crate::rate::RtpDataCounter;
use crate::rtcp::{
    CompoundPacket, Nack, Pli, ReceptionReport, Rtcp, SenderInfo, MAX_AUDIO_INTERVAL_MS,
    MAX_VIDEO_INTERVAL_MS,
};
use crate::rtp::{extend_u16, ExtensionIds, Mid, Rid, RtpHeader, Ssrc};
use crate::time::{TimerHandle, TimerQueue};

/// A sequence jump this large is a stream reset, not packet loss.
const MAX_NACK_GAP: u64 = 500;

pub use crate::channel::MediaKind as ProducerKind;

/// Outcome of feeding one RTP packet to a producer.
#[derive(Debug, Default)]
pub struct ProducerReceiveResult {
    /// The packet belongs to one of the producer's streams.
    pub accepted: bool,
    /// The packet should be republished to this producer's consumers.
    pub forward: bool,
    /// First packet of a previously unseen stream.
    pub new_stream: Option<Ssrc>,
    /// Missing packets detected, to be sent out as RTCP.
    pub nack: Option<Nack>,
    /// `(ssrc, score, previous_score)` when a stream score changed.
    pub score_change: Option<(Ssrc, u8, u8)>,
}

/// Receive-side state of one endpoint's published stream.
///
/// Owns one RTP stream per SSRC with loss/jitter/score bookkeeping,
/// contributes receiver reports to the compound scheduler and detects
/// gaps worth NACKing.
#[derive(Debug)]
pub struct Producer {
    id: String,
    kind: MediaKind,
    paused: bool,
    mid: Option<Mid>,
    cname: Option<String>,
    ext_ids: ExtensionIds,
    /// SSRC and RID declared in signaling. Streams come alive on the
    /// first packet.
    declared_ssrcs: Vec<Ssrc>,
    declared_rtx_ssrcs: Vec<Ssrc>,
    declared_rids: Vec<Rid>,
    simulcast: bool,
    streams: HashMap<Ssrc, RtpStreamRecv>,
    key_frame_manager: KeyFrameRequestManager,
    max_rtcp_interval: u64,
    last_rtcp_sent_at: u64,
}

impl Producer {
    pub fn new(id: String, data: ProduceData) -> Result<Self, RequestError> {
        let params = &data.rtp_parameters;

        if params.encodings.is_empty() {
            return Err(RequestError::TypeError("missing encodings".into()));
        }

        let mut declared_ssrcs = Vec::new();
        let mut declared_rtx_ssrcs = Vec::new();
        let mut declared_rids = Vec::new();

        for encoding in &params.encodings {
            if let Some(ssrc) = encoding.ssrc {
                declared_ssrcs.push(Ssrc::from(ssrc));
            } else if encoding.rid.is_none() {
                return Err(RequestError::TypeError(
                    "encoding has neither ssrc nor rid".into(),
                ));
            }
            if let Some(rid) = &encoding.rid {
                declared_rids.push(Rid::from(rid.as_str()));
            }
            if let Some(rtx) = &encoding.rtx {
                declared_rtx_ssrcs.push(Ssrc::from(rtx.ssrc));
            }
        }

        let ext_ids = ExtensionIds::from_pairs(
            params
                .header_extensions
                .iter()
                .map(|h| (h.uri.as_str(), h.id)),
        );

        let max_rtcp_interval = match data.kind {
            MediaKind::Audio => MAX_AUDIO_INTERVAL_MS,
            MediaKind::Video => MAX_VIDEO_INTERVAL_MS,
        };

        Ok(Producer {
            id,
            kind: data.kind,
            paused: data.paused,
            mid: params.mid.as_deref().map(Mid::from),
            cname: params.rtcp.cname.clone(),
            ext_ids,
            simulcast: params.encodings.len() > 1,
            declared_ssrcs,
            declared_rtx_ssrcs,
            declared_rids,
            streams: HashMap::new(),
            key_frame_manager: KeyFrameRequestManager::new(),
            max_rtcp_interval,
            last_rtcp_sent_at: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// "simple" or "simulcast", reported back on TRANSPORT_PRODUCE.
    pub fn type_str(&self) -> &'static str {
        if self.simulcast {
            "simulcast"
        } else {
            "simple"
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn mid(&self) -> Option<Mid> {
        self.mid
    }

    pub fn rids(&self) -> &[Rid] {
        &self.declared_rids
    }

    /// SSRC the RTP listener should route to this producer.
    pub fn ssrcs(&self) -> impl Iterator<Item = Ssrc> + '_ {
        self.declared_ssrcs
            .iter()
            .chain(self.declared_rtx_ssrcs.iter())
            .copied()
    }

    /// The header extension ids negotiated for this producer, merged
    /// into the transport's table on creation.
    pub fn rtp_header_extension_ids(&self) -> &ExtensionIds {
        &self.ext_ids
    }

    /// Whether this producer would accept packets with this header via
    /// MID/RID matching (used when the SSRC is not yet known).
    pub fn matches_header(&self, header: &RtpHeader) -> bool {
        let by_mid = match (self.mid, header.ext_vals.mid) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => false,
        };
        let by_rid = header
            .ext_vals
            .rid
            .map(|rid| self.declared_rids.contains(&rid))
            .unwrap_or(false);

        by_mid || by_rid
    }

    /// Feed one inbound RTP packet (header view plus wire size).
    pub fn receive_rtp_packet(
        &mut self,
        header: &RtpHeader,
        size: usize,
        now_ms: u64,
    ) -> ProducerReceiveResult {
        let mut result = ProducerReceiveResult::default();

        if self.declared_rtx_ssrcs.contains(&header.ssrc) {
            // Repair streams only matter for their side effects on the
            // listener tables; the payload is not routed further.
            trace!("ignoring packet of RTX stream {}", header.ssrc);
            result.accepted = true;
            return result;
        }

        let known = self.streams.contains_key(&header.ssrc);
        if !known {
            let declared = self.declared_ssrcs.contains(&header.ssrc) || self.matches_header(header);
            if !declared {
                return result;
            }

            let clock_rate = match self.kind {
                MediaKind::Audio => 48_000,
                MediaKind::Video => 90_000,
            };
            self.streams
                .insert(header.ssrc, RtpStreamRecv::new(header.ssrc, clock_rate));
            result.new_stream = Some(header.ssrc);
        }

        let nack_enabled = self.kind == MediaKind::Video;
        let stream = self.streams.get_mut(&header.ssrc).expect("stream exists");
        let missing = stream.receive(header, size, now_ms);

        if nack_enabled {
            if let Some(missing) = missing {
                result.nack = Nack::from_missing(header.ssrc, &missing);
            }
        }

        result.accepted = true;
        result.forward = !self.paused;
        result
    }

    /// An RTCP sender report for one of our streams. Returns whether it
    /// was the stream's first one.
    pub fn receive_rtcp_sender_report(&mut self, info: &SenderInfo, now_ms: u64) -> Option<bool> {
        let stream = self.streams.get_mut(&info.ssrc)?;

        let first = !stream.sr_received;
        stream.sr_received = true;
        stream.last_sr = Some(LastSenderReport {
            lsr: info.lsr(),
            received_at_ms: now_ms,
        });

        Some(first)
    }

    /// Contribute receiver reports to the compound packet, at most once
    /// per RTCP interval. Returns score changes to publish.
    pub fn get_rtcp(
        &mut self,
        packet: &mut CompoundPacket,
        worst_remote_fraction_lost: u8,
        now_ms: u64,
    ) -> Vec<(Ssrc, u8, u8)> {
        let elapsed = now_ms.saturating_sub(self.last_rtcp_sent_at);
        if (elapsed as f64 * 1.15) < self.max_rtcp_interval as f64 {
            return Vec::new();
        }
        self.last_rtcp_sent_at = now_ms;

        let mut score_changes = Vec::new();

        for stream in self.streams.values_mut() {
            let report = stream.receiver_report(worst_remote_fraction_lost, now_ms);
            packet.add_receiver_report(report);

            let previous = stream.score;
            stream.update_score();
            if stream.score != previous {
                score_changes.push((stream.ssrc, stream.score, previous));
            }
        }

        score_changes
    }

    /// Ask the publishing endpoint for a key frame on every stream.
    /// Requests within the pending window are absorbed.
    pub fn request_key_frame(&mut self, timers: &mut TimerQueue, now_ms: u64) -> Vec<Rtcp> {
        if self.kind != MediaKind::Video {
            return Vec::new();
        }

        let mut out = Vec::new();
        for ssrc in self.streams.keys().copied().collect::<Vec<_>>() {
            if self.key_frame_manager.key_frame_needed(ssrc, timers, now_ms) {
                out.push(pli(ssrc));
            }
        }
        out
    }

    /// The embedder saw a key frame arrive (e.g. via payload inspection
    /// outside this crate); the retry for it is cancelled.
    pub fn key_frame_received(&mut self, ssrc: Ssrc, timers: &mut TimerQueue) {
        self.key_frame_manager.key_frame_received(ssrc, timers);
    }

    /// A key frame wait timer fired: re-emit the request once.
    pub fn on_timer(&mut self, handle: TimerHandle) -> Option<Rtcp> {
        let ssrc = self.key_frame_manager.on_timer(handle)?;
        Some(pli(ssrc))
    }

    /// Average score over the producer's streams (0 when none yet).
    pub fn score(&self) -> u8 {
        if self.streams.is_empty() {
            return 0;
        }
        let sum: u32 = self.streams.values().map(|s| s.score as u32).sum();
        (sum / self.streams.len() as u32) as u8
    }

    pub fn dump(&self) -> ProducerDump {
        ProducerDump {
            id: self.id.clone(),
            kind: self.kind,
            paused: self.paused,
            rtp_streams: self
                .streams
                .values()
                .map(|s| RtpStreamDump {
                    ssrc: *s.ssrc,
                    score: s.score,
                })
                .collect(),
        }
    }

    pub fn get_stats(&mut self, now_ms: u64) -> Vec<ProducerStat> {
        self.streams
            .values_mut()
            .map(|s| ProducerStat {
                ssrc: *s.ssrc,
                packet_count: s.counter.packet_count(),
                byte_count: s.counter.bytes(),
                bitrate: s.counter.get_bitrate(now_ms),
                jitter: s.jitter as u32,
                packets_lost: s.cumulative_lost(),
                fraction_lost: s.fraction_lost,
                score: s.score,
            })
            .collect()
    }
}

fn pli(ssrc: Ssrc) -> Rtcp {
    Rtcp::Pli(Pli::new(ssrc))
}

#[derive(Debug, Clone, Copy)]
struct LastSenderReport {
    /// Middle 32 bits of the SR NTP timestamp.
    lsr: u32,
    received_at_ms: u64,
}

#[derive(Debug)]
struct RtpStreamRecv {
    ssrc: Ssrc,
    clock_rate: u32,
    started: bool,
    base_seq: u64,
    max_seq: u64,
    received: u64,
    expected_prior: u64,
    received_prior: u64,
    fraction_lost: u8,
    jitter: f64,
    transit: Option<i64>,
    score: u8,
    counter: RtpDataCounter,
    sr_received: bool,
    last_sr: Option<LastSenderReport>,
}

impl RtpStreamRecv {
    fn new(ssrc: Ssrc, clock_rate: u32) -> Self {
        RtpStreamRecv {
            ssrc,
            clock_rate,
            started: false,
            base_seq: 0,
            max_seq: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            fraction_lost: 0,
            jitter: 0.0,
            transit: None,
            score: 10,
            counter: RtpDataCounter::new(),
            sr_received: false,
            last_sr: None,
        }
    }

    /// Update counters with one packet. Returns freshly missing
    /// sequence numbers when a forward gap opened.
    fn receive(&mut self, header: &RtpHeader, size: usize, now_ms: u64) -> Option<Vec<u16>> {
        self.counter.update(size, now_ms);
        self.update_jitter(header.timestamp, now_ms);

        let ext_seq = extend_u16(
            self.started.then_some(self.max_seq),
            header.sequence_number,
        );

        if !self.started {
            self.started = true;
            self.base_seq = ext_seq;
            self.max_seq = ext_seq;
            self.received = 1;
            return None;
        }

        self.received += 1;

        if ext_seq <= self.max_seq {
            // Out of order or duplicate, nothing newly missing.
            return None;
        }

        let gap = ext_seq - self.max_seq;
        let previous_max = self.max_seq;
        self.max_seq = ext_seq;

        if gap > MAX_NACK_GAP {
            debug!(
                "large sequence jump on ssrc {}, resyncing instead of nacking",
                self.ssrc
            );
            self.base_seq = ext_seq;
            self.expected_prior = 0;
            self.received_prior = 0;
            self.received = 1;
            return None;
        }

        if gap > 1 {
            let missing = (previous_max + 1..ext_seq).map(|s| s as u16).collect();
            return Some(missing);
        }

        None
    }

    fn update_jitter(&mut self, rtp_timestamp: u32, now_ms: u64) {
        // RFC 3550 A.8, with arrival expressed in RTP units.
        let arrival = (now_ms as i64 * self.clock_rate as i64) / 1000;
        let transit = arrival - rtp_timestamp as i64;

        if let Some(previous) = self.transit {
            let d = (transit - previous).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }

        self.transit = Some(transit);
    }

    fn cumulative_lost(&self) -> u32 {
        let expected = self.max_seq - self.base_seq + 1;
        (expected.saturating_sub(self.received)).min(0x7F_FFFF) as u32
    }

    fn receiver_report(&mut self, worst_remote_fraction_lost: u8, now_ms: u64) -> ReceptionReport {
        // RFC 3550 A.3: loss over the interval since the previous report.
        let expected = if self.started {
            self.max_seq - self.base_seq + 1
        } else {
            0
        };
        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = expected_interval.saturating_sub(received_interval);
        self.fraction_lost = if expected_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        // Worst downstream loss wins, so the publisher adapts for the
        // worst receiver.
        let fraction_lost = self.fraction_lost.max(worst_remote_fraction_lost);

        let (last_sr_time, last_sr_delay) = match self.last_sr {
            Some(sr) => {
                let delay_ms = now_ms.saturating_sub(sr.received_at_ms);
                (sr.lsr, ((delay_ms * 65_536) / 1000) as u32)
            }
            None => (0, 0),
        };

        ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost,
            packets_lost: self.cumulative_lost(),
            max_seq: self.max_seq as u32,
            jitter: self.jitter as u32,
            last_sr_time,
            last_sr_delay,
        }
    }

    fn update_score(&mut self) {
        let penalty = (self.fraction_lost as f64 / 25.5).round() as u8;
        self.score = 10_u8.saturating_sub(penalty);
    }
}

/// Dump DTO sent over the control channel.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDump {
    pub id: String,
    pub kind: MediaKind,
    pub paused: bool,
    pub rtp_streams: Vec<RtpStreamDump>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpStreamDump {
    pub ssrc: u32,
    pub score: u8,
}

/// Per-stream stats DTO.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerStat {
    pub ssrc: u32,
    pub packet_count: u64,
    pub byte_count: u64,
    pub bitrate: u32,
    pub jitter: u32,
    pub packets_lost: u32,
    pub fraction_lost: u8,
    pub score: u8,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::{EncodingData, HeaderExtensionData, RtpParametersData};

    fn produce_data(kind: MediaKind, ssrc: u32) -> ProduceData {
        ProduceData {
            kind,
            paused: false,
            rtp_parameters: RtpParametersData {
                mid: Some("0".into()),
                encodings: vec![EncodingData {
                    ssrc: Some(ssrc),
                    rid: None,
                    rtx: None,
                }],
                header_extensions: vec![HeaderExtensionData {
                    uri: "urn:ietf:params:rtp-hdrext:sdes:mid".into(),
                    id: 4,
                }],
                rtcp: Default::default(),
            },
        }
    }

    fn header(ssrc: u32, seq: u16, timestamp: u32) -> RtpHeader {
        let mut header = RtpHeader {
            version: 2,
            has_padding: false,
            has_extension: false,
            marker: false,
            payload_type: 96.into(),
            sequence_number: seq,
            timestamp,
            ssrc: ssrc.into(),
            ext_vals: Default::default(),
            header_len: 12,
            ext_offsets: Default::default(),
        };
        header.ext_vals.mid = None;
        header
    }

    #[test]
    fn first_packet_creates_stream() {
        let mut producer = Producer::new("p1".into(), produce_data(MediaKind::Video, 1111)).unwrap();

        let result = producer.receive_rtp_packet(&header(1111, 100, 0), 1000, 0);
        assert!(result.accepted);
        assert!(result.forward);
        assert_eq!(result.new_stream, Some(1111.into()));

        let result = producer.receive_rtp_packet(&header(1111, 101, 0), 1000, 20);
        assert!(result.new_stream.is_none());
    }

    #[test]
    fn unknown_ssrc_is_rejected() {
        let mut producer = Producer::new("p1".into(), produce_data(MediaKind::Video, 1111)).unwrap();

        let result = producer.receive_rtp_packet(&header(9999, 100, 0), 1000, 0);
        assert!(!result.accepted);
    }

    #[test]
    fn gap_generates_nack() {
        let mut producer = Producer::new("p1".into(), produce_data(MediaKind::Video, 1111)).unwrap();

        producer.receive_rtp_packet(&header(1111, 100, 0), 1000, 0);
        let result = producer.receive_rtp_packet(&header(1111, 104, 0), 1000, 20);

        let nack = result.nack.expect("nack for the gap");
        assert_eq!(*nack.ssrc, 1111);
        let entry = nack.reports.get(0).unwrap();
        assert_eq!(entry.pid, 101);
        assert_eq!(entry.blp, 0b11);
    }

    #[test]
    fn audio_does_not_nack() {
        let mut producer = Producer::new("p1".into(), produce_data(MediaKind::Audio, 2222)).unwrap();

        producer.receive_rtp_packet(&header(2222, 100, 0), 500, 0);
        let result = producer.receive_rtp_packet(&header(2222, 110, 0), 500, 20);

        assert!(result.nack.is_none());
    }

    #[test]
    fn paused_producer_accepts_but_does_not_forward() {
        let mut producer = Producer::new("p1".into(), produce_data(MediaKind::Video, 1111)).unwrap();
        producer.pause();

        let result = producer.receive_rtp_packet(&header(1111, 100, 0), 1000, 0);
        assert!(result.accepted);
        assert!(!result.forward);
    }

    #[test]
    fn receiver_report_counts_interval_loss() {
        let mut producer = Producer::new("p1".into(), produce_data(MediaKind::Video, 1111)).unwrap();

        // 4 of 8 packets arrive.
        for seq in [100_u16, 101, 104, 107] {
            producer.receive_rtp_packet(&header(1111, seq, 0), 1000, seq as u64);
        }

        let mut compound = CompoundPacket::new();
        let _ = producer.get_rtcp(&mut compound, 0, 10_000);
        assert_eq!(compound.receiver_report_count(), 1);

        let stream = producer.streams.get(&1111.into()).unwrap();
        // expected 8, received 4.
        assert_eq!(stream.fraction_lost, 128);
        assert_eq!(stream.cumulative_lost(), 4);
    }

    #[test]
    fn worst_remote_fraction_lost_wins() {
        let mut producer = Producer::new("p1".into(), produce_data(MediaKind::Video, 1111)).unwrap();
        producer.receive_rtp_packet(&header(1111, 100, 0), 1000, 0);

        let mut compound = CompoundPacket::new();
        producer.get_rtcp(&mut compound, 77, 10_000);

        // The report carries the worse downstream loss.
        let mut buf = vec![0; 256];
        let n = compound.serialize(&mut buf);
        buf.truncate(n);

        let mut parsed = std::collections::VecDeque::new();
        Rtcp::read_packet(&buf, &mut parsed);
        let Rtcp::ReceiverReport(rr) = &parsed[0] else {
            panic!("expected receiver report");
        };
        assert_eq!(rr.reports.get(0).unwrap().fraction_lost, 77);
    }

    #[test]
    fn sender_report_first_flag() {
        let mut producer = Producer::new("p1".into(), produce_data(MediaKind::Video, 1111)).unwrap();
        producer.receive_rtp_packet(&header(1111, 100, 0), 1000, 0);

        let info = SenderInfo {
            ssrc: 1111.into(),
            ntp_seconds: 10,
            ntp_fraction: 0,
            rtp_timestamp: 0,
            sender_packet_count: 1,
            sender_octet_count: 100,
        };

        assert_eq!(producer.receive_rtcp_sender_report(&info, 100), Some(true));
        assert_eq!(producer.receive_rtcp_sender_report(&info, 200), Some(false));

        let unknown = SenderInfo {
            ssrc: 9999.into(),
            ..info
        };
        assert_eq!(producer.receive_rtcp_sender_report(&unknown, 300), None);
    }

    #[test]
    fn key_frame_requests_are_absorbed_while_pending() {
        let mut timers = TimerQueue::new();
        let mut producer = Producer::new("p1".into(), produce_data(MediaKind::Video, 1111)).unwrap();
        producer.receive_rtp_packet(&header(1111, 100, 0), 1000, 0);

        let first = producer.request_key_frame(&mut timers, 0);
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0], Rtcp::Pli(_)));

        let second = producer.request_key_frame(&mut timers, 100);
        assert!(second.is_empty());
    }

    #[test]
    fn rtcp_interval_is_respected() {
        let mut producer = Producer::new("p1".into(), produce_data(MediaKind::Video, 1111)).unwrap();
        producer.receive_rtp_packet(&header(1111, 100, 0), 1000, 0);

        let mut compound = CompoundPacket::new();
        producer.get_rtcp(&mut compound, 0, 10_000);
        assert_eq!(compound.receiver_report_count(), 1);

        // Immediately again: skipped.
        let mut compound = CompoundPacket::new();
        producer.get_rtcp(&mut compound, 0, 10_100);
        assert_eq!(compound.receiver_report_count(), 0);
    }
}
