//! Contracts for the pluggable send-side bandwidth estimator.
//!
//! The actual estimator (delay/loss based congestion control in the
//! Google style) is a large external collaborator. The router drives it
//! exclusively through [`BweController`] and [`PacerControl`], so a pure
//! Rust re-implementation or a bridge to a vendored library can be
//! plugged in without touching the routing code.

use crate::rtcp::{ReceptionReport, Twcc};
use crate::rtp::Ssrc;

/// Everything the estimator needs to know about a packet entering the
/// send path.
#[derive(Debug, Clone, Copy)]
pub struct PacketSendInfo {
    pub ssrc: Ssrc,
    /// Transport-wide sequence number stamped on the packet.
    pub wide_seq: u16,
    /// The RTP sequence number inside the stream.
    pub rtp_seq: u16,
    /// Size of the packet on the wire.
    pub length: usize,
    pub pacing_info: PacingInfo,
}

/// Probe cluster information attached to paced sends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacingInfo {
    /// Set when the packet belongs to a bandwidth probe cluster.
    pub probe_cluster_id: Option<i32>,
}

/// The send-side bandwidth estimator.
///
/// Mirrors the surface of the Google congestion controller: packets in,
/// feedback in, target transfer rate out. The target rate is polled
/// rather than observed via callback registration.
pub trait BweController {
    /// The network became usable/unusable (transport connect state).
    fn on_network_availability(&mut self, available: bool);

    /// A packet was handed to the send path.
    fn on_add_packet(&mut self, info: &PacketSendInfo);

    /// A packet actually left for the wire.
    fn on_sent_packet(&mut self, wide_seq: u16, send_time_ms: u64, length: usize);

    /// A transport-wide feedback arrived from the remote.
    fn on_transport_feedback(&mut self, feedback: &Twcc);

    /// An RTCP receiver report arrived for one of our streams.
    fn on_receiver_report(&mut self, report: &ReceptionReport, rtt_ms: f32, now_ms: u64);

    /// A REMB estimate arrived (legacy path).
    fn on_estimated_bitrate(&mut self, bitrate_bps: u32);

    /// Bitrate allocation limits decided by the application.
    fn set_allocated_bitrate_limits(
        &mut self,
        min_bps: u32,
        max_padding_bps: u32,
        max_total_bps: u32,
    );

    /// The latest target transfer rate, if it changed since last poll.
    fn poll_target_rate(&mut self) -> Option<u32>;

    /// Access to the pacer driving the send schedule.
    fn pacer(&mut self) -> &mut dyn PacerControl;
}

/// The packet pacer inside the estimator.
pub trait PacerControl {
    /// Account a media packet entering the send path.
    fn insert_packet(&mut self, bytes: usize);

    /// Run one pacing round. Returns the number of padding bytes the
    /// pacer wants generated right now (0 for none).
    fn process(&mut self, now_ms: u64) -> usize;

    /// Milliseconds until [`PacerControl::process`] should run again.
    fn time_until_next_process(&mut self, now_ms: u64) -> u64;

    /// Pacing info to stamp on packets sent in this round.
    fn pacing_info(&self) -> PacingInfo;
}

/// Controller used when no estimator is plugged in: absorbs all input
/// and never produces a target rate.
#[derive(Debug, Default)]
pub struct NullController {
    pacer: NullPacer,
}

impl NullController {
    pub fn new() -> Self {
        NullController::default()
    }
}

impl BweController for NullController {
    fn on_network_availability(&mut self, _available: bool) {}

    fn on_add_packet(&mut self, _info: &PacketSendInfo) {}

    fn on_sent_packet(&mut self, _wide_seq: u16, _send_time_ms: u64, _length: usize) {}

    fn on_transport_feedback(&mut self, _feedback: &Twcc) {}

    fn on_receiver_report(&mut self, _report: &ReceptionReport, _rtt_ms: f32, _now_ms: u64) {}

    fn on_estimated_bitrate(&mut self, _bitrate_bps: u32) {}

    fn set_allocated_bitrate_limits(
        &mut self,
        _min_bps: u32,
        _max_padding_bps: u32,
        _max_total_bps: u32,
    ) {
    }

    fn poll_target_rate(&mut self) -> Option<u32> {
        None
    }

    fn pacer(&mut self) -> &mut dyn PacerControl {
        &mut self.pacer
    }
}

/// Pacer that releases nothing and asks for no padding.
#[derive(Debug, Default)]
pub struct NullPacer;

impl PacerControl for NullPacer {
    fn insert_packet(&mut self, _bytes: usize) {}

    fn process(&mut self, _now_ms: u64) -> usize {
        0
    }

    fn time_until_next_process(&mut self, _now_ms: u64) -> u64 {
        // The floor the reference pacer uses between process rounds.
        5
    }

    fn pacing_info(&self) -> PacingInfo {
        PacingInfo::default()
    }
}
