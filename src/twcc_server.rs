use std::collections::VecDeque;
use std::mem;

use crate::rtcp::{Twcc, TwccFeedback};
use crate::time::{TimerHandle, TimerQueue};

/// How often the periodic feedback goes out.
const FEEDBACK_SEND_INTERVAL: u64 = 100; // In ms.

/// Server side of transport-wide congestion control.
///
/// Accumulates the arrival times of inbound RTP packets tagged with the
/// transport-wide sequence number extension, and turns them into
/// feedback packets: every 100 ms while the transport is connected, plus
/// immediately whenever the feedback under construction fills up.
///
/// Completed packets are queued; the owning transport drains them with
/// [`TwccServer::poll_packet`] after every entry point.
#[derive(Debug)]
pub struct TwccServer {
    max_rtcp_packet_len: usize,
    feedback: TwccFeedback,
    feedback_packet_count: u8,
    timer: Option<TimerHandle>,
    out: VecDeque<Twcc>,
}

impl TwccServer {
    pub fn new(max_rtcp_packet_len: usize) -> Self {
        TwccServer {
            max_rtcp_packet_len,
            feedback: TwccFeedback::new(0.into(), 0.into()),
            feedback_packet_count: 0,
            timer: None,
            out: VecDeque::new(),
        }
    }

    pub fn transport_connected(&mut self, timers: &mut TimerQueue, now_ms: u64) {
        if let Some(timer) = self.timer.take() {
            timers.stop(timer);
        }
        self.timer = Some(timers.schedule_periodic(
            now_ms + FEEDBACK_SEND_INTERVAL,
            FEEDBACK_SEND_INTERVAL,
        ));
    }

    pub fn transport_disconnected(&mut self, timers: &mut TimerQueue) {
        if let Some(timer) = self.timer.take() {
            timers.stop(timer);
        }
    }

    pub fn is_timer(&self, handle: TimerHandle) -> bool {
        self.timer == Some(handle)
    }

    pub fn on_timer(&mut self) {
        self.send_feedback();
    }

    /// Register the arrival of a packet carrying a wide sequence number.
    pub fn incoming_packet(&mut self, arrival_ms: u64, wide_seq: u16) {
        // Provide the feedback packet with the RTP packet info. If it
        // fails, send the current feedback and add the packet to a new one.
        if !self
            .feedback
            .add_packet(wide_seq, arrival_ms, self.max_rtcp_packet_len)
        {
            trace!("packet cannot be added into the feedback, sending feedback now");

            self.send_feedback();

            self.feedback
                .add_packet(wide_seq, arrival_ms, self.max_rtcp_packet_len);
        }

        // If the feedback packet is full, send it now.
        if self.feedback.is_full() {
            trace!("feedback packet is full, sending feedback now");

            self.send_feedback();
        }
    }

    /// Drain the next completed feedback packet.
    pub fn poll_packet(&mut self) -> Option<Twcc> {
        self.out.pop_front()
    }

    fn send_feedback(&mut self) {
        if !self.feedback.is_serializable() {
            return;
        }

        let last = self.feedback.last_received();

        self.feedback_packet_count = self.feedback_packet_count.wrapping_add(1);

        let mut next = TwccFeedback::new(0.into(), 0.into());
        next.set_feedback_packet_count(self.feedback_packet_count);

        // Pass the last packet info as pre base for the new feedback, so
        // the first delta of the next packet stays meaningful.
        if let Some((seq, timestamp_ms)) = last {
            next.add_packet(seq, timestamp_ms, self.max_rtcp_packet_len);
        }

        let done = mem::replace(&mut self.feedback, next);

        if let Some(twcc) = done.build() {
            self.out.push_back(twcc);
        }
    }
}
