use std::collections::BTreeMap;
use std::time::Instant;

/// Monotonic millisecond clock anchored at process start.
///
/// The core never calls this itself. The embedding loop reads it once per
/// event and passes the value down, which keeps all internal state
/// reproducible under a virtual clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Handle identifying a timer owned by a [`TimerQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy)]
struct TimerState {
    deadline: u64,
    /// Re-arm interval for periodic timers.
    every: Option<u64>,
}

/// One-shot and periodic timers, owned by the scheduler, keyed by handle.
///
/// The queue never fires anything by itself. The owner polls
/// [`TimerQueue::poll_timeout`] for the earliest deadline, sleeps until
/// then, and calls [`TimerQueue::handle_timeout`] which returns the
/// handles that came due. Dispatch happens in the owner by matching
/// handles, so there is no registry of callbacks and no loop singleton.
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_handle: u64,
    timers: BTreeMap<TimerHandle, TimerState>,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue::default()
    }

    /// Schedule a one-shot timer at an absolute time.
    pub fn schedule(&mut self, at_ms: u64) -> TimerHandle {
        self.insert(TimerState {
            deadline: at_ms,
            every: None,
        })
    }

    /// Schedule a periodic timer. It first fires at `first_ms` and then
    /// every `every_ms` after the previous deadline.
    pub fn schedule_periodic(&mut self, first_ms: u64, every_ms: u64) -> TimerHandle {
        assert!(every_ms > 0, "periodic timer with zero interval");
        self.insert(TimerState {
            deadline: first_ms,
            every: Some(every_ms),
        })
    }

    fn insert(&mut self, state: TimerState) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.timers.insert(handle, state);
        handle
    }

    /// Move an existing timer to a new deadline. Unknown handles are
    /// ignored, which makes restart-after-stop patterns cheap.
    pub fn restart(&mut self, handle: TimerHandle, at_ms: u64) {
        if let Some(t) = self.timers.get_mut(&handle) {
            t.deadline = at_ms;
        }
    }

    /// Stop and forget a timer. Stopping an unknown handle is a no-op.
    pub fn stop(&mut self, handle: TimerHandle) {
        self.timers.remove(&handle);
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.timers.contains_key(&handle)
    }

    /// The earliest pending deadline, if any.
    pub fn poll_timeout(&self) -> Option<u64> {
        self.timers.values().map(|t| t.deadline).min()
    }

    /// Pop every timer with `deadline <= now_ms`. Periodic timers are
    /// re-armed relative to their previous deadline so they do not drift
    /// with dispatch latency. Handles are returned in creation order.
    pub fn handle_timeout(&mut self, now_ms: u64) -> Vec<TimerHandle> {
        let mut fired = Vec::new();

        for (handle, t) in &mut self.timers {
            if t.deadline <= now_ms {
                fired.push(*handle);
                if let Some(every) = t.every {
                    let mut next = t.deadline + every;
                    // Catch up if the loop stalled for several periods.
                    if next <= now_ms {
                        next = now_ms + every;
                    }
                    t.deadline = next;
                }
            }
        }

        self.timers
            .retain(|_, t| !(t.every.is_none() && t.deadline <= now_ms));

        fired
    }
}
