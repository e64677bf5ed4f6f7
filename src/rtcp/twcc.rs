use std::collections::VecDeque;
use std::fmt;

use crate::rtp::{is_seq_lower_than, Ssrc};

use super::{FeedbackMessageType, RtcpHeader, RtcpPacket};
use super::{RtcpType, TransportType};

/// Max run length in a run-length chunk (13 bits).
const MAX_RUN_LENGTH: u16 = 8191;
/// Max missing packets representable between two received ones.
const MAX_MISSING_PACKETS: u16 = MAX_RUN_LENGTH;
/// Max packet statuses a single feedback can carry.
const MAX_PACKET_STATUS_COUNT: u16 = u16::MAX;
/// Max receive delta in 250 us ticks (the draft reserves the top values).
const MAX_PACKET_DELTA_TICKS: i64 = 0x7FFC;

/// Transport-wide congestion control feedback.
///
/// Reports the arrival time of every RTP packet carrying the
/// transport-wide sequence number extension, as ranges of statuses plus
/// per-packet receive deltas.
#[derive(Clone, PartialEq, Eq)]
pub struct Twcc {
    /// Sender of this feedback. Mostly irrelevant, but part of RTCP packets.
    pub sender_ssrc: Ssrc,
    /// The media SSRC this report nominally belongs to.
    pub ssrc: Ssrc,
    /// Start sequence number.
    pub base_seq: u16,
    /// Number of reported statuses.
    pub status_count: u16,
    /// Reference time in multiples of 64 ms (24 bits on the wire).
    pub reference_time: u32,
    /// Increasing counter for each feedback. For deduping.
    pub feedback_count: u8,
    /// Ranges received.
    pub chunks: VecDeque<PacketChunk>,
    /// Delta times for the packets received.
    pub delta: VecDeque<Delta>,
}

impl Twcc {
    fn chunks_byte_len(&self) -> usize {
        self.chunks.len() * 2
    }

    fn delta_byte_len(&self) -> usize {
        self.delta.iter().map(|d| d.byte_len()).sum()
    }

    /// Reference time in milliseconds.
    pub fn reference_time_ms(&self) -> u64 {
        self.reference_time as u64 * 64
    }

    /// Iterate over the reported sequences as
    /// `(wide seq, status, delta in 250 us ticks)`.
    pub fn iter(&self) -> TwccIter<'_> {
        TwccIter {
            twcc: self,
            chunk: 0,
            index: 0,
            emitted: 0,
            seq: self.base_seq,
            delta: self.delta.iter(),
        }
    }
}

impl fmt::Debug for Twcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Twcc")
            .field("base_seq", &self.base_seq)
            .field("status_count", &self.status_count)
            .field("reference_time", &self.reference_time)
            .field("feedback_count", &self.feedback_count)
            .field("chunks", &self.chunks)
            .field("delta", &self.delta)
            .finish()
    }
}

pub struct TwccIter<'a> {
    twcc: &'a Twcc,
    chunk: usize,
    index: usize,
    emitted: u16,
    seq: u16,
    delta: std::collections::vec_deque::Iter<'a, Delta>,
}

impl<'a> Iterator for TwccIter<'a> {
    type Item = (u16, PacketStatus, Option<i16>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.emitted >= self.twcc.status_count {
            return None;
        }

        let chunk = self.twcc.chunks.get(self.chunk)?;

        let status = match chunk {
            PacketChunk::Run(s, _) => *s,
            PacketChunk::VectorSingle(bits) => {
                if bits >> (13 - self.index) & 1 > 0 {
                    PacketStatus::ReceivedSmallDelta
                } else {
                    PacketStatus::NotReceived
                }
            }
            PacketChunk::VectorDouble(bits) => {
                PacketStatus::from(((bits >> (12 - self.index * 2)) & 0b11) as u8)
            }
        };

        let delta = match status {
            PacketStatus::ReceivedSmallDelta => match self.delta.next()? {
                Delta::Small(v) => Some(*v as i16),
                Delta::Large(_) => return None,
            },
            PacketStatus::ReceivedLargeOrNegativeDelta => match self.delta.next()? {
                Delta::Small(_) => return None,
                Delta::Large(v) => Some(*v),
            },
            _ => None,
        };

        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.emitted += 1;
        self.index += 1;
        if self.index == chunk.status_count() {
            self.chunk += 1;
            self.index = 0;
        }

        Some((seq, status, delta))
    }
}

impl RtcpPacket for Twcc {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::TransportLayerFeedback,
            feedback_message_type: FeedbackMessageType::TransportFeedback(
                TransportType::TransportWide,
            ),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // One word each for the header, both SSRC, base seq + status
        // count and reference time + feedback count; then chunks and
        // deltas padded up to a word.
        5 + super::pad_bytes_to_word(self.chunks_byte_len() + self.delta_byte_len()) / 4
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[12..14].copy_from_slice(&self.base_seq.to_be_bytes());
        buf[14..16].copy_from_slice(&self.status_count.to_be_bytes());
        buf[16..19].copy_from_slice(&self.reference_time.to_be_bytes()[1..4]);
        buf[19] = self.feedback_count;

        let mut offset = 20;
        for chunk in &self.chunks {
            chunk.write_to(&mut buf[offset..]);
            offset += 2;
        }
        for delta in &self.delta {
            offset += delta.write_to(&mut buf[offset..]);
        }

        let end = super::pad_bytes_to_word(offset);
        if end > offset {
            for b in &mut buf[offset..end] {
                *b = 0;
            }
            buf[end - 1] = (end - offset) as u8;
            buf[0] |= 0b00_1_00000;
        }

        end
    }
}

impl<'a> TryFrom<&'a [u8]> for Twcc {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 16 {
            return Err("Less than 16 bytes for start of Twcc");
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]).into();
        let base_seq = u16::from_be_bytes([buf[8], buf[9]]);
        let status_count = u16::from_be_bytes([buf[10], buf[11]]);
        let reference_time = u32::from_be_bytes([0, buf[12], buf[13], buf[14]]);
        let feedback_count = buf[15];

        let mut twcc = Twcc {
            sender_ssrc,
            ssrc,
            base_seq,
            status_count,
            reference_time,
            feedback_count,
            chunks: VecDeque::new(),
            delta: VecDeque::new(),
        };

        let mut todo = status_count as isize;
        let mut buf = &buf[16..];
        while todo > 0 {
            if buf.len() < 2 {
                return Err("Less than 2 bytes for Twcc chunk");
            }

            let chunk: PacketChunk = buf.try_into()?;

            todo -= chunk.status_count() as isize;

            twcc.chunks.push_back(chunk);
            buf = &buf[2..];
        }

        if twcc.chunks.is_empty() {
            return Ok(twcc);
        }

        // Each reported "received" status has a delta.
        let mut todo = status_count;
        'outer: for chunk in &twcc.chunks {
            for status in chunk.statuses() {
                if todo == 0 {
                    break 'outer;
                }
                todo -= 1;

                match status {
                    PacketStatus::NotReceived | PacketStatus::Unknown => continue,
                    PacketStatus::ReceivedSmallDelta => {
                        if buf.is_empty() {
                            return Err("Not enough buf for small Twcc delta");
                        }
                        twcc.delta.push_back(Delta::Small(buf[0]));
                        buf = &buf[1..];
                    }
                    PacketStatus::ReceivedLargeOrNegativeDelta => {
                        if buf.len() < 2 {
                            return Err("Not enough buf for large Twcc delta");
                        }
                        let v = i16::from_be_bytes([buf[0], buf[1]]);
                        twcc.delta.push_back(Delta::Large(v));
                        buf = &buf[2..];
                    }
                }
            }
        }

        Ok(twcc)
    }
}

/// One status chunk covering a range of sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketChunk {
    /// 2 bit status repeated 13-bit count times.
    Run(PacketStatus, u16),
    /// 14 packets of 1 bit received/not-received.
    VectorSingle(u16),
    /// 7 packets of 2 bit status.
    VectorDouble(u16),
}

impl PacketChunk {
    /// How many packet statuses this chunk covers.
    pub fn status_count(&self) -> usize {
        match self {
            PacketChunk::Run(_, n) => *n as usize,
            PacketChunk::VectorSingle(_) => 14,
            PacketChunk::VectorDouble(_) => 7,
        }
    }

    fn statuses(&self) -> impl Iterator<Item = PacketStatus> + '_ {
        let count = self.status_count();
        (0..count).map(move |i| match self {
            PacketChunk::Run(s, _) => *s,
            PacketChunk::VectorSingle(bits) => {
                if bits >> (13 - i) & 1 > 0 {
                    PacketStatus::ReceivedSmallDelta
                } else {
                    PacketStatus::NotReceived
                }
            }
            PacketChunk::VectorDouble(bits) => {
                PacketStatus::from(((bits >> (12 - i * 2)) & 0b11) as u8)
            }
        })
    }

    fn write_to(&self, buf: &mut [u8]) {
        //     0                   1
        //     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
        //    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
        //    |T| S |       Run Length        |
        //    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
        //
        //        0                   1
        //        0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
        //       +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
        //       |T|S|       symbol list         |
        //       +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
        let x: u16 = match self {
            PacketChunk::Run(s, n) => {
                assert!(*n <= MAX_RUN_LENGTH);
                ((*s as u16) << 13) | n
            }
            PacketChunk::VectorSingle(bits) => (1 << 15) | (bits & 0x3FFF),
            PacketChunk::VectorDouble(bits) => (1 << 15) | (1 << 14) | (bits & 0x3FFF),
        };
        buf[..2].copy_from_slice(&x.to_be_bytes());
    }
}

impl<'a> TryFrom<&'a [u8]> for PacketChunk {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 2 {
            return Err("Less than 2 bytes for PacketChunk");
        }

        let x = u16::from_be_bytes([buf[0], buf[1]]);

        if x & 0x8000 == 0 {
            let status = PacketStatus::from(((x >> 13) & 0b11) as u8);
            if status == PacketStatus::Unknown {
                return Err("Unknown PacketStatus in run length chunk");
            }
            Ok(PacketChunk::Run(status, x & 0x1FFF))
        } else if x & 0x4000 == 0 {
            Ok(PacketChunk::VectorSingle(x & 0x3FFF))
        } else {
            Ok(PacketChunk::VectorDouble(x & 0x3FFF))
        }
    }
}

/// Status of one transport-wide sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    NotReceived = 0b00,
    ReceivedSmallDelta = 0b01,
    ReceivedLargeOrNegativeDelta = 0b10,
    Unknown = 0b11,
}

impl From<u8> for PacketStatus {
    fn from(v: u8) -> Self {
        match v {
            0b00 => Self::NotReceived,
            0b01 => Self::ReceivedSmallDelta,
            0b10 => Self::ReceivedLargeOrNegativeDelta,
            _ => Self::Unknown,
        }
    }
}

/// One receive time delta, in 250 us ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Small(u8),
    Large(i16),
}

impl Delta {
    fn write_to(&self, buf: &mut [u8]) -> usize {
        match self {
            Delta::Small(v) => {
                buf[0] = *v;
                1
            }
            Delta::Large(v) => {
                buf[..2].copy_from_slice(&v.to_be_bytes());
                2
            }
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            Delta::Small(_) => 1,
            Delta::Large(_) => 2,
        }
    }
}

/// Incrementally built transport-wide feedback.
///
/// The TCC server owns one of these at a time, feeding it each arriving
/// `(wide seq, arrival time)`. When a packet cannot be added (delta too
/// large, too many missing, size budget reached) the feedback is sent as
/// is and a fresh builder takes over, seeded with the last packet of the
/// previous one as its pre-base so continuity is preserved.
#[derive(Debug)]
pub struct TwccFeedback {
    sender_ssrc: Ssrc,
    media_ssrc: Ssrc,
    /// Candidate base. The first delta of the packet is emitted relative
    /// to this packet's arrival time.
    pre_base: Option<(u16, u64)>,
    base_seq: u16,
    /// Arrival of the base packet in ms. Serialised in 64 ms units.
    reference_time_ms: u64,
    feedback_packet_count: u8,
    packet_status_count: u16,
    last_seq: u16,
    last_timestamp_ms: u64,
    received_count: usize,
    chunks: VecDeque<PacketChunk>,
    deltas: VecDeque<Delta>,
    context: ChunkContext,
    /// Bytes of chunks and deltas emitted so far.
    size: usize,
}

/// Buffer of up to 7 statuses not yet committed to a chunk.
#[derive(Debug, Default)]
struct ChunkContext {
    statuses: Vec<PacketStatus>,
    all_same_status: bool,
    current_status: Option<PacketStatus>,
}

impl TwccFeedback {
    pub fn new(sender_ssrc: Ssrc, media_ssrc: Ssrc) -> Self {
        TwccFeedback {
            sender_ssrc,
            media_ssrc,
            pre_base: None,
            base_seq: 0,
            reference_time_ms: 0,
            feedback_packet_count: 0,
            packet_status_count: 0,
            last_seq: 0,
            last_timestamp_ms: 0,
            received_count: 0,
            chunks: VecDeque::new(),
            deltas: VecDeque::new(),
            context: ChunkContext::default(),
            size: 0,
        }
    }

    pub fn set_feedback_packet_count(&mut self, count: u8) {
        self.feedback_packet_count = count;
    }

    /// The last `(wide seq, arrival ms)` added, to seed the next builder.
    pub fn last_received(&self) -> Option<(u16, u64)> {
        (self.received_count > 0).then_some((self.last_seq, self.last_timestamp_ms))
    }

    /// Whether no further statuses can be represented.
    pub fn is_full(&self) -> bool {
        self.packet_status_count == MAX_PACKET_STATUS_COUNT
    }

    /// Whether there is anything worth sending.
    pub fn is_serializable(&self) -> bool {
        self.received_count > 0
    }

    /// Current serialized size in bytes, without the pending statuses.
    pub fn size(&self) -> usize {
        // common header + sender/media SSRC + fixed feedback fields
        4 + 8 + 8 + self.size
    }

    /// Register the arrival of a transport-wide sequence number.
    ///
    /// Returns `false` when the packet cannot be represented in this
    /// feedback; the caller sends the feedback and retries on a new one.
    pub fn add_packet(&mut self, wide_seq: u16, timestamp_ms: u64, max_len: usize) -> bool {
        assert!(!self.is_full(), "add_packet on full feedback");

        let delta_ticks;

        let Some((pre_base_seq, pre_base_ts)) = self.pre_base else {
            trace!("setting pre base");
            self.pre_base = Some((wide_seq, timestamp_ms));
            return true;
        };

        if self.received_count == 0 && wide_seq != pre_base_seq.wrapping_add(1) {
            debug!("not valid as base, resetting pre base");
            self.pre_base = Some((wide_seq, timestamp_ms));
            return true;
        }

        if self.received_count == 0 {
            // This is the base (but let's see).
            match check_delta(pre_base_ts, timestamp_ms) {
                Some(ticks) => delta_ticks = ticks,
                None => {
                    debug!(
                        "packet delta exceeded, not valid as base, resetting pre base \
                         [pre_base_ts:{}, timestamp_ms:{}]",
                        pre_base_ts, timestamp_ms
                    );
                    self.pre_base = Some((wide_seq, timestamp_ms));
                    return true;
                }
            }

            trace!("setting base");
            self.base_seq = wide_seq;
            self.reference_time_ms = timestamp_ms;

            self.fill_chunk(pre_base_seq, wide_seq, delta_ticks);
        } else {
            // Equal or lower than the highest seen is ignored as a
            // successful no-op. Not very spec compliant but libWebRTC
            // reuses sequence numbers this way.
            if wide_seq == self.last_seq || is_seq_lower_than(wide_seq, self.last_seq) {
                return true;
            }

            let missing = wide_seq.wrapping_sub(self.last_seq.wrapping_add(1));
            if missing > MAX_MISSING_PACKETS {
                debug!("missing packet number exceeded");
                return false;
            }

            match check_delta(self.last_timestamp_ms, timestamp_ms) {
                Some(ticks) => delta_ticks = ticks,
                None => {
                    debug!(
                        "packet delta exceeded [last_timestamp_ms:{}, timestamp_ms:{}]",
                        self.last_timestamp_ms, timestamp_ms
                    );
                    return false;
                }
            }

            if !self.check_size(max_len) {
                debug!("maximum packet size exceeded");
                return false;
            }

            self.fill_chunk(self.last_seq, wide_seq, delta_ticks);
        }

        self.last_seq = wide_seq;
        self.last_timestamp_ms = timestamp_ms;
        self.received_count += 1;

        true
    }

    /// Whether another chunk and its delta infos would still fit.
    fn check_size(&self, max_len: usize) -> bool {
        let mut size = self.size();

        // Maximum size needed for another chunk and its delta infos.
        size += 2;
        size += 2 * 7;

        // 32 bits padding.
        size += size.wrapping_neg() & 3;

        size <= max_len
    }

    fn fill_chunk(&mut self, previous_seq: u16, seq: u16, delta_ticks: u16) {
        let mut missing = seq.wrapping_sub(previous_seq.wrapping_add(1));

        if missing > 0 {
            // Flush a homogeneous run before shifting in the gap.
            if self.context.statuses.len() >= 7 && self.context.all_same_status {
                let status = self.context.current_status.expect("a current status");
                let count = self.context.statuses.len() as u16;
                self.create_run_length_chunk(status, count);

                self.context.statuses.clear();
                self.context.current_status = None;
            }

            let mut represented = 0;
            while missing > represented && self.context.statuses.len() < 7 {
                self.push_status(PacketStatus::NotReceived);
                represented += 1;
            }

            if self.context.statuses.len() == 7 {
                self.create_two_bit_vector_chunk();
                self.context.current_status = None;
            }

            missing -= represented;

            // Not all missing packets have been represented.
            if missing != 0 {
                self.create_run_length_chunk(PacketStatus::NotReceived, missing);

                self.context.statuses.clear();
                self.context.current_status = None;
            }
        }

        let status = if delta_ticks <= 255 {
            PacketStatus::ReceivedSmallDelta
        } else {
            PacketStatus::ReceivedLargeOrNegativeDelta
        };

        // Flush a homogeneous run before a status that would break it.
        if self.context.statuses.len() >= 7
            && self.context.all_same_status
            && Some(status) != self.context.current_status
        {
            let current = self.context.current_status.expect("a current status");
            let count = self.context.statuses.len() as u16;
            self.create_run_length_chunk(current, count);

            self.context.statuses.clear();
        }

        self.push_status(status);

        if status == PacketStatus::ReceivedSmallDelta {
            self.deltas.push_back(Delta::Small(delta_ticks as u8));
            self.size += 1;
        } else {
            self.deltas.push_back(Delta::Large(delta_ticks as i16));
            self.size += 2;
        }

        // 7 statuses with heterogeneous content become a vector chunk.
        // Homogeneous statuses keep accumulating into a future run.
        if self.context.statuses.len() == 7 && !self.context.all_same_status {
            self.context.current_status = None;
            self.create_two_bit_vector_chunk();
        }
    }

    fn push_status(&mut self, status: PacketStatus) {
        self.context.all_same_status = self.context.current_status.is_none()
            || (self.context.all_same_status && self.context.current_status == Some(status));
        self.context.current_status = Some(status);
        self.context.statuses.push(status);
    }

    fn create_run_length_chunk(&mut self, status: PacketStatus, count: u16) {
        self.chunks.push_back(PacketChunk::Run(status, count));
        self.packet_status_count = self.packet_status_count.saturating_add(count);
        self.size += 2;
    }

    fn create_two_bit_vector_chunk(&mut self) {
        assert!(self.context.statuses.len() == 7, "status buffer must be 7");

        let mut bits = 0_u16;
        for (i, status) in self.context.statuses.iter().enumerate() {
            bits |= (*status as u16) << (12 - i * 2);
        }

        self.chunks.push_back(PacketChunk::VectorDouble(bits));
        self.packet_status_count = self.packet_status_count.saturating_add(7);
        self.size += 2;
        self.context.statuses.clear();
    }

    /// Flush pending statuses into chunks.
    ///
    /// A homogeneous buffer becomes one run-length chunk; a heterogeneous
    /// one becomes run-length chunks per consecutive equal group.
    fn add_pending_chunks(&mut self) {
        if self.context.statuses.is_empty() {
            return;
        }

        if self.context.all_same_status {
            let status = self.context.current_status.expect("a current status");
            let count = self.context.statuses.len() as u16;
            self.create_run_length_chunk(status, count);
        } else {
            let statuses = std::mem::take(&mut self.context.statuses);
            let mut current = statuses[0];
            let mut count = 0_u16;

            for status in &statuses {
                if *status == current {
                    count += 1;
                } else {
                    self.create_run_length_chunk(current, count);
                    current = *status;
                    count = 1;
                }
            }

            self.create_run_length_chunk(current, count);
        }

        self.context.statuses.clear();
        self.context.current_status = None;
    }

    /// Finalize into the wire representation. `None` when there is
    /// nothing to send.
    pub fn build(mut self) -> Option<Twcc> {
        if !self.is_serializable() {
            return None;
        }

        self.add_pending_chunks();

        Some(Twcc {
            sender_ssrc: self.sender_ssrc,
            ssrc: self.media_ssrc,
            base_seq: self.base_seq,
            status_count: self.packet_status_count,
            reference_time: ((self.reference_time_ms / 64) & 0xFF_FFFF) as u32,
            feedback_count: self.feedback_packet_count,
            chunks: self.chunks,
            delta: self.deltas,
        })
    }
}

/// Receive delta between two arrival times as 250 us ticks.
///
/// A single signed 64 bit computation guards both the base and the live
/// path before anything narrows to 16 bits.
fn check_delta(previous_ms: u64, next_ms: u64) -> Option<u16> {
    let delta_ms = next_ms as i64 - previous_ms as i64;
    let ticks = delta_ms * 4;

    if (0..=MAX_PACKET_DELTA_TICKS).contains(&ticks) {
        Some(ticks as u16)
    } else {
        None
    }
}
