use std::collections::HashMap;

use crate::rtp::Ssrc;
use crate::time::{TimerHandle, TimerQueue};

/// How long to wait for a requested key frame before retrying.
const KEY_FRAME_WAIT_TIME: u64 = 2000; // In ms.

/// Deduplicates and retries key frame requests per SSRC.
///
/// A request opens a pending window: further requests for the same SSRC
/// are absorbed until either the key frame arrives or the wait timer
/// fires, which grants one retry. The caller performs the actual
/// PLI/FIR emission whenever a method reports the request should go out.
#[derive(Debug, Default)]
pub struct KeyFrameRequestManager {
    pending: HashMap<Ssrc, TimerHandle>,
}

impl KeyFrameRequestManager {
    pub fn new() -> Self {
        KeyFrameRequestManager::default()
    }

    /// A key frame for `ssrc` is needed. Returns whether a request
    /// should be sent now; duplicates within the wait window are absorbed.
    pub fn key_frame_needed(&mut self, ssrc: Ssrc, timers: &mut TimerQueue, now_ms: u64) -> bool {
        if self.pending.contains_key(&ssrc) {
            trace!("key frame request for ssrc {} already ongoing", ssrc);
            return false;
        }

        let timer = timers.schedule(now_ms + KEY_FRAME_WAIT_TIME);
        self.pending.insert(ssrc, timer);

        true
    }

    /// A key frame is needed regardless of any pending request. The wait
    /// window restarts; the request always goes out.
    pub fn force_key_frame_needed(
        &mut self,
        ssrc: Ssrc,
        timers: &mut TimerQueue,
        now_ms: u64,
    ) -> bool {
        if let Some(timer) = self.pending.remove(&ssrc) {
            timers.stop(timer);
        }

        let timer = timers.schedule(now_ms + KEY_FRAME_WAIT_TIME);
        self.pending.insert(ssrc, timer);

        true
    }

    /// A key frame arrived for `ssrc`; the pending request (if any) is
    /// satisfied.
    pub fn key_frame_received(&mut self, ssrc: Ssrc, timers: &mut TimerQueue) {
        if let Some(timer) = self.pending.remove(&ssrc) {
            timers.stop(timer);
        }
    }

    /// Dispatch a fired timer handle. When it belongs to a pending
    /// request, that request is granted one retry: the pending state is
    /// dropped and the SSRC to re-request is returned.
    pub fn on_timer(&mut self, handle: TimerHandle) -> Option<Ssrc> {
        let ssrc = self
            .pending
            .iter()
            .find(|(_, t)| **t == handle)
            .map(|(ssrc, _)| *ssrc)?;

        self.pending.remove(&ssrc);

        debug!("key frame for ssrc {} not received on time, retrying", ssrc);

        Some(ssrc)
    }
}
