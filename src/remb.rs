use crate::rate::RtpDataCounter;

/// Min interval between dispatched REMB events.
const EVENT_INTERVAL: u64 = 2000; // In ms.
/// Without REMB feedback for this long the state is stale.
const MAX_EVENT_INTERVAL: u64 = 5000; // In ms.

/// Outcome of a processed REMB feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RembClientEvent {
    /// Bitrate still unused on top of current transmission.
    RemainingBitrate(u32),
    /// Transmission exceeds what the remote estimates to be available.
    ExceedingBitrate(u32),
}

/// Legacy receiver-estimated-max-bitrate handling for the send direction.
///
/// Tracks the REMB values a remote reports against the transport's own
/// transmission rate and condenses them into remaining/exceeding events,
/// at most one per [`EVENT_INTERVAL`]. When feedback dries up for
/// [`MAX_EVENT_INTERVAL`] the estimate snaps back to the initial value.
#[derive(Debug)]
pub struct RembClient {
    initial_available_bitrate: u32,
    available_bitrate: u32,
    remb_bitrate: u32,
    last_event_at: u64,
    transmission_counter: RtpDataCounter,
}

impl RembClient {
    pub fn new(initial_available_bitrate: u32, now_ms: u64) -> Self {
        RembClient {
            initial_available_bitrate,
            available_bitrate: initial_available_bitrate,
            remb_bitrate: 0,
            last_event_at: now_ms,
            transmission_counter: RtpDataCounter::new(),
        }
    }

    /// Account an outgoing RTP packet.
    pub fn receive_rtp_packet(&mut self, size: usize, now_ms: u64) {
        self.transmission_counter.update(size, now_ms);
    }

    /// Process a REMB feedback from the remote.
    pub fn receive_remb_feedback(&mut self, remb_bitrate: u32, now_ms: u64) -> Option<RembClientEvent> {
        // If we don't have recent data yet, start from here and make
        // sure the next event fires soon.
        if !self.check_status(now_ms) {
            self.last_event_at = now_ms.saturating_sub(EVENT_INTERVAL / 2);
            return None;
        }

        if now_ms - self.last_event_at < EVENT_INTERVAL {
            return None;
        }

        self.last_event_at = now_ms;

        let previous_remb_bitrate = self.remb_bitrate;
        self.remb_bitrate = remb_bitrate;

        let trend = self.remb_bitrate as i64 - previous_remb_bitrate as i64;
        let used_bitrate = self.transmission_counter.get_bitrate(now_ms);

        self.available_bitrate = self.remb_bitrate;

        if self.available_bitrate >= used_bitrate {
            let remaining = self.available_bitrate - used_bitrate;

            trace!(
                "usable bitrate [available:{} >= used:{}, remaining:{}]",
                self.available_bitrate,
                used_bitrate,
                remaining
            );

            Some(RembClientEvent::RemainingBitrate(remaining))
        } else if trend > 0 && self.remb_bitrate > self.initial_available_bitrate {
            trace!(
                "positive REMB trend [available:{} < used:{}, trend:{}]",
                self.available_bitrate,
                used_bitrate,
                trend
            );

            Some(RembClientEvent::RemainingBitrate(trend as u32))
        } else {
            let exceeding = used_bitrate - self.available_bitrate;

            trace!(
                "exceeding bitrate [available:{} < used:{}, exceeding:{}]",
                self.available_bitrate,
                used_bitrate,
                exceeding
            );

            Some(RembClientEvent::ExceedingBitrate(exceeding))
        }
    }

    pub fn get_available_bitrate(&mut self, now_ms: u64) -> u32 {
        self.check_status(now_ms);
        self.available_bitrate
    }

    /// Push the next event at least one full interval away.
    pub fn reschedule_next_event(&mut self, now_ms: u64) {
        self.last_event_at = now_ms;
    }

    fn check_status(&mut self, now_ms: u64) -> bool {
        if now_ms - self.last_event_at < MAX_EVENT_INTERVAL {
            true
        } else {
            self.available_bitrate = self.initial_available_bitrate;
            self.remb_bitrate = 0;
            false
        }
    }
}

/// Server-side REMB state: the estimate we report to the remote sender,
/// capped by the configured max incoming bitrate.
///
/// The remote bitrate *estimator* feeding this is an external
/// collaborator; the transport only stores its output here and caps it.
#[derive(Debug, Default)]
pub struct RembServerState {
    available_bitrate: u32,
    max_incoming_bitrate: u32,
}

impl RembServerState {
    pub fn new() -> Self {
        RembServerState::default()
    }

    pub fn set_max_incoming_bitrate(&mut self, bitrate: u32) {
        self.max_incoming_bitrate = bitrate;
    }

    pub fn set_available_bitrate(&mut self, bitrate: u32) {
        self.available_bitrate = bitrate;
    }

    /// The bitrate to advertise in outgoing REMB, when there is one.
    pub fn effective_bitrate(&self) -> Option<u32> {
        if self.available_bitrate == 0 && self.max_incoming_bitrate == 0 {
            return None;
        }
        if self.available_bitrate == 0 {
            return Some(self.max_incoming_bitrate);
        }
        if self.max_incoming_bitrate == 0 {
            return Some(self.available_bitrate);
        }
        Some(self.available_bitrate.min(self.max_incoming_bitrate))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remaining_bitrate_event() {
        let mut client = RembClient::new(1_000_000, 0);

        // ~500 kbps of transmission in the current window.
        for i in 0..50 {
            client.receive_rtp_packet(1250, 1000 + i * 20);
        }

        let event = client.receive_remb_feedback(600_000, 2000);
        assert_eq!(event, Some(RembClientEvent::RemainingBitrate(100_000)));
    }

    #[test]
    fn stale_state_snaps_back_to_initial() {
        let mut client = RembClient::new(1_000_000, 0);

        for i in 0..50 {
            client.receive_rtp_packet(1250, 1000 + i * 20);
        }
        client.receive_remb_feedback(600_000, 2000);
        assert_eq!(client.get_available_bitrate(2100), 600_000);

        // MaxEventInterval of silence.
        assert_eq!(client.get_available_bitrate(7100), 1_000_000);
    }

    #[test]
    fn exceeding_bitrate_event() {
        let mut client = RembClient::new(1_000_000, 0);

        // Prime a first REMB so the next one has a trend to compare.
        for i in 0..50 {
            client.receive_rtp_packet(1250, i * 20);
        }
        client.receive_remb_feedback(800_000, 2000);

        // Keep transmitting ~500 kbps, then a REMB below the used rate.
        for i in 0..50 {
            client.receive_rtp_packet(1250, 4000 + i * 20);
        }
        let event = client.receive_remb_feedback(300_000, 4900);
        assert_eq!(event, Some(RembClientEvent::ExceedingBitrate(200_000)));
    }

    #[test]
    fn events_are_rate_limited() {
        let mut client = RembClient::new(1_000_000, 0);

        assert!(client.receive_remb_feedback(600_000, 2000).is_some());
        // Within EventInterval: swallowed.
        assert!(client.receive_remb_feedback(400_000, 2500).is_none());
    }

    #[test]
    fn server_state_caps_by_max_incoming() {
        let mut state = RembServerState::new();
        assert_eq!(state.effective_bitrate(), None);

        state.set_available_bitrate(2_000_000);
        assert_eq!(state.effective_bitrate(), Some(2_000_000));

        state.set_max_incoming_bitrate(1_500_000);
        assert_eq!(state.effective_bitrate(), Some(1_500_000));
    }
}
