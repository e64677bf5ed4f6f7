use crate::bwe::{BweController, PacingInfo, PacketSendInfo};
use crate::probation::RtpProbationGenerator;
use crate::rtcp::{ReceptionReport, Twcc};
use crate::rtp::RtpPacket;
use crate::time::{TimerHandle, TimerQueue};

/// Min interval between available-bitrate notifications.
const AVAILABLE_BITRATE_EVENT_INTERVAL: u64 = 2000; // In ms.

/// Default length of generated probation padding packets.
const PROBATION_PACKET_LEN: usize = 1100;

/// Callbacks from the TCC client into its owning transport.
pub trait TwccClientListener {
    /// The estimated available outgoing bitrate changed enough to act on.
    fn on_available_bitrate(&mut self, available_bitrate: u32, previous_bitrate: u32);

    /// The pacer wants this probation packet on the wire.
    fn send_probation_packet(&mut self, packet: &mut RtpPacket, pacing_info: PacingInfo);
}

/// Client side of transport-wide congestion control.
///
/// Feeds a pluggable bandwidth estimator with every sent packet and all
/// incoming feedback, paces probing padding through a timer, and
/// throttles how often target-rate changes reach the transport: at most
/// every 2 s, except that a drop below 75% of the previous value is
/// propagated immediately.
pub struct TwccClient {
    controller: Box<dyn BweController>,
    probation_generator: RtpProbationGenerator,
    available_bitrate: u32,
    /// 0 until the controller produced its first rate. The first event
    /// is swallowed, it fires while everything is still half built.
    last_available_bitrate_event_at: u64,
    pacer_timer: Option<TimerHandle>,
}

impl std::fmt::Debug for TwccClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwccClient")
            .field("available_bitrate", &self.available_bitrate)
            .field(
                "last_available_bitrate_event_at",
                &self.last_available_bitrate_event_at,
            )
            .finish()
    }
}

impl TwccClient {
    pub fn new(
        controller: Box<dyn BweController>,
        initial_available_bitrate: u32,
        timers: &mut TimerQueue,
        now_ms: u64,
    ) -> Self {
        let mut client = TwccClient {
            controller,
            probation_generator: RtpProbationGenerator::new(PROBATION_PACKET_LEN),
            available_bitrate: initial_available_bitrate,
            last_available_bitrate_event_at: 0,
            pacer_timer: None,
        };

        let delay = client.controller.pacer().time_until_next_process(now_ms);
        client.pacer_timer = Some(timers.schedule(now_ms + delay));

        client
    }

    pub fn transport_connected(&mut self) {
        self.controller.on_network_availability(true);
    }

    pub fn transport_disconnected(&mut self) {
        self.controller.on_network_availability(false);
    }

    /// Account a media packet entering the paced send path.
    pub fn insert_packet(&mut self, bytes: usize) {
        self.controller.pacer().insert_packet(bytes);
    }

    pub fn pacing_info(&mut self) -> PacingInfo {
        self.controller.pacer().pacing_info()
    }

    /// A packet left for the wire.
    pub fn packet_sent(&mut self, info: &PacketSendInfo, now_ms: u64) {
        self.controller.on_add_packet(info);
        self.controller
            .on_sent_packet(info.wide_seq, now_ms, info.length);
    }

    /// REMB from the remote (legacy estimation path).
    pub fn receive_estimated_bitrate(
        &mut self,
        bitrate: u32,
        now_ms: u64,
        listener: &mut dyn TwccClientListener,
    ) {
        self.controller.on_estimated_bitrate(bitrate);
        self.poll_controller(now_ms, listener);
    }

    pub fn receive_rtcp_receiver_report(
        &mut self,
        report: &ReceptionReport,
        rtt_ms: f32,
        now_ms: u64,
        listener: &mut dyn TwccClientListener,
    ) {
        self.controller.on_receiver_report(report, rtt_ms, now_ms);
        self.poll_controller(now_ms, listener);
    }

    pub fn receive_rtcp_transport_feedback(
        &mut self,
        feedback: &Twcc,
        now_ms: u64,
        listener: &mut dyn TwccClientListener,
    ) {
        self.controller.on_transport_feedback(feedback);
        self.poll_controller(now_ms, listener);
    }

    /// Forward allocation limits into the controller.
    pub fn set_desired_bitrates(
        &mut self,
        min_bitrate: u32,
        max_padding_bitrate: u32,
        max_total_bitrate: u32,
    ) {
        self.controller
            .set_allocated_bitrate_limits(min_bitrate, max_padding_bitrate, max_total_bitrate);
    }

    pub fn available_bitrate(&self) -> u32 {
        self.available_bitrate
    }

    /// Push the next notification at least one full interval away.
    pub fn reschedule_next_available_bitrate_event(&mut self, now_ms: u64) {
        self.last_available_bitrate_event_at = now_ms;
    }

    pub fn is_pacer_timer(&self, handle: TimerHandle) -> bool {
        self.pacer_timer == Some(handle)
    }

    /// One pacing round: release padding if the pacer asks for it, then
    /// re-arm the timer for the next round.
    pub fn on_pacer_timer(
        &mut self,
        timers: &mut TimerQueue,
        now_ms: u64,
        listener: &mut dyn TwccClientListener,
    ) {
        let mut padding_bytes = self.controller.pacer().process(now_ms);

        while padding_bytes > 0 {
            let pacing_info = self.controller.pacer().pacing_info();
            let packet = self.probation_generator.get_next_packet();
            let len = packet.len();

            listener.send_probation_packet(packet, pacing_info);

            padding_bytes = padding_bytes.saturating_sub(len);
        }

        self.poll_controller(now_ms, listener);

        let delay = self.controller.pacer().time_until_next_process(now_ms);
        self.pacer_timer = Some(timers.schedule(now_ms + delay));
    }

    /// Pick up a new target transfer rate from the controller and decide
    /// whether the transport should hear about it.
    fn poll_controller(&mut self, now_ms: u64, listener: &mut dyn TwccClientListener) {
        let Some(target_rate) = self.controller.poll_target_rate() else {
            return;
        };

        let previous_bitrate = self.available_bitrate;
        self.available_bitrate = target_rate;

        trace!("new available bitrate: {}", self.available_bitrate);

        // Ignore the very first event, it happens during bootstrap.
        if self.last_available_bitrate_event_at == 0 {
            self.last_available_bitrate_event_at = now_ms;
            return;
        }

        let elapsed = now_ms - self.last_available_bitrate_event_at;

        let notify = if elapsed >= AVAILABLE_BITRATE_EVENT_INTERVAL {
            true
        } else if (self.available_bitrate as f64) < previous_bitrate as f64 * 0.75 {
            warn!(
                "high BWE value decrease detected, notifying the listener [now:{}, before:{}]",
                self.available_bitrate, previous_bitrate
            );
            true
        } else {
            false
        };

        if notify {
            self.last_available_bitrate_event_at = now_ms;
            listener.on_available_bitrate(self.available_bitrate, previous_bitrate);
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::bwe::{NullPacer, PacerControl};

    /// Controller whose next target rate is set from the outside.
    struct TestController {
        target: Rc<RefCell<Option<u32>>>,
        pacer: NullPacer,
    }

    impl BweController for TestController {
        fn on_network_availability(&mut self, _available: bool) {}
        fn on_add_packet(&mut self, _info: &PacketSendInfo) {}
        fn on_sent_packet(&mut self, _wide_seq: u16, _send_time_ms: u64, _length: usize) {}
        fn on_transport_feedback(&mut self, _feedback: &Twcc) {}
        fn on_receiver_report(&mut self, _report: &ReceptionReport, _rtt_ms: f32, _now_ms: u64) {}
        fn on_estimated_bitrate(&mut self, _bitrate_bps: u32) {}
        fn set_allocated_bitrate_limits(&mut self, _min: u32, _max_padding: u32, _max_total: u32) {}
        fn poll_target_rate(&mut self) -> Option<u32> {
            self.target.borrow_mut().take()
        }
        fn pacer(&mut self) -> &mut dyn PacerControl {
            &mut self.pacer
        }
    }

    /// Pacer that requests a fixed amount of padding once.
    struct PaddingPacer(usize);

    impl PacerControl for PaddingPacer {
        fn insert_packet(&mut self, _bytes: usize) {}
        fn process(&mut self, _now_ms: u64) -> usize {
            std::mem::take(&mut self.0)
        }
        fn time_until_next_process(&mut self, _now_ms: u64) -> u64 {
            5
        }
        fn pacing_info(&self) -> PacingInfo {
            PacingInfo {
                probe_cluster_id: Some(1),
            }
        }
    }

    struct PaddingController(PaddingPacer);

    impl BweController for PaddingController {
        fn on_network_availability(&mut self, _available: bool) {}
        fn on_add_packet(&mut self, _info: &PacketSendInfo) {}
        fn on_sent_packet(&mut self, _wide_seq: u16, _send_time_ms: u64, _length: usize) {}
        fn on_transport_feedback(&mut self, _feedback: &Twcc) {}
        fn on_receiver_report(&mut self, _report: &ReceptionReport, _rtt_ms: f32, _now_ms: u64) {}
        fn on_estimated_bitrate(&mut self, _bitrate_bps: u32) {}
        fn set_allocated_bitrate_limits(&mut self, _min: u32, _max_padding: u32, _max_total: u32) {}
        fn poll_target_rate(&mut self) -> Option<u32> {
            None
        }
        fn pacer(&mut self) -> &mut dyn PacerControl {
            &mut self.0
        }
    }

    #[derive(Default)]
    struct Events {
        bitrates: Vec<(u32, u32)>,
        probation: usize,
    }

    impl TwccClientListener for Events {
        fn on_available_bitrate(&mut self, available: u32, previous: u32) {
            self.bitrates.push((available, previous));
        }
        fn send_probation_packet(&mut self, _packet: &mut RtpPacket, _info: PacingInfo) {
            self.probation += 1;
        }
    }

    fn feedback() -> Twcc {
        Twcc {
            sender_ssrc: 0.into(),
            ssrc: 0.into(),
            base_seq: 0,
            status_count: 0,
            reference_time: 0,
            feedback_count: 0,
            chunks: Default::default(),
            delta: Default::default(),
        }
    }

    fn client(
        initial: u32,
        timers: &mut TimerQueue,
    ) -> (TwccClient, Rc<RefCell<Option<u32>>>) {
        let target = Rc::new(RefCell::new(None));
        let controller = Box::new(TestController {
            target: Rc::clone(&target),
            pacer: NullPacer,
        });
        (TwccClient::new(controller, initial, timers, 0), target)
    }

    #[test]
    fn first_target_rate_is_suppressed() {
        let mut timers = TimerQueue::new();
        let (mut client, target) = client(600_000, &mut timers);
        let mut events = Events::default();

        *target.borrow_mut() = Some(500_000);
        client.receive_rtcp_transport_feedback(&feedback(), 100, &mut events);

        assert!(events.bitrates.is_empty());
        assert_eq!(client.available_bitrate(), 500_000);
    }

    #[test]
    fn interval_gates_notifications() {
        let mut timers = TimerQueue::new();
        let (mut client, target) = client(600_000, &mut timers);
        let mut events = Events::default();

        // Bootstrap event at t=100.
        *target.borrow_mut() = Some(500_000);
        client.receive_rtcp_transport_feedback(&feedback(), 100, &mut events);

        // Small change within the interval: suppressed.
        *target.borrow_mut() = Some(490_000);
        client.receive_rtcp_transport_feedback(&feedback(), 500, &mut events);
        assert!(events.bitrates.is_empty());

        // Past the interval: notified.
        *target.borrow_mut() = Some(480_000);
        client.receive_rtcp_transport_feedback(&feedback(), 2200, &mut events);
        assert_eq!(events.bitrates, vec![(480_000, 490_000)]);
    }

    #[test]
    fn fast_down_bypasses_interval() {
        let mut timers = TimerQueue::new();
        let (mut client, target) = client(1_000_000, &mut timers);
        let mut events = Events::default();

        *target.borrow_mut() = Some(1_000_000);
        client.receive_rtcp_transport_feedback(&feedback(), 100, &mut events);

        // 60% drop right away: notified despite the interval.
        *target.borrow_mut() = Some(400_000);
        client.receive_rtcp_transport_feedback(&feedback(), 300, &mut events);

        assert_eq!(events.bitrates, vec![(400_000, 1_000_000)]);
    }

    #[test]
    fn pacer_padding_becomes_probation_packets() {
        let mut timers = TimerQueue::new();
        // Asks for ~2.5 packets worth of padding in the first round.
        let controller = Box::new(PaddingController(PaddingPacer(2800)));
        let mut client = TwccClient::new(controller, 600_000, &mut timers, 0);
        let mut events = Events::default();

        let handle = timers.handle_timeout(5).pop().unwrap();
        assert!(client.is_pacer_timer(handle));
        client.on_pacer_timer(&mut timers, 5, &mut events);

        assert_eq!(events.probation, 3);

        // Timer re-armed for the next round.
        assert_eq!(timers.poll_timeout(), Some(10));
    }
}
