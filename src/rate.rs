/// Sliding-window rate estimator with fixed resolution.
///
/// The window of `window_size_ms` is split into `window_items` slots held
/// in a circular buffer. Each slot accumulates the byte count of samples
/// whose timestamp falls within the slot's `item_size_ms` span. The rate
/// is `total_count * scale / window_size_ms`, so with the default scale of
/// 8000 the result is bits per second.
#[derive(Debug)]
pub struct RateCalculator {
    window_size_ms: u64,
    scale: f64,
    window_items: usize,
    item_size_ms: u64,
    buffer: Vec<BufferItem>,
    newest_item_start_time: u64,
    newest_item_index: Option<usize>,
    oldest_item_start_time: u64,
    oldest_item_index: Option<usize>,
    total_count: u64,
    /// Total bytes transmitted since creation, never retired.
    bytes: u64,
    last: Option<(u64, u32)>,
}

#[derive(Debug, Default, Clone, Copy)]
struct BufferItem {
    count: u64,
    time: u64,
}

impl Default for RateCalculator {
    fn default() -> Self {
        RateCalculator::new(1000, 8000.0, 100)
    }
}

impl RateCalculator {
    pub fn new(window_size_ms: u64, scale: f64, window_items: usize) -> Self {
        assert!(window_items > 0, "window must have at least one item");
        let item_size_ms = (window_size_ms / window_items as u64).max(1);

        RateCalculator {
            window_size_ms,
            scale,
            window_items,
            item_size_ms,
            buffer: vec![BufferItem::default(); window_items],
            newest_item_start_time: 0,
            newest_item_index: None,
            oldest_item_start_time: 0,
            oldest_item_index: None,
            total_count: 0,
            bytes: 0,
            last: None,
        }
    }

    /// Record `size` bytes at `now_ms`. Samples older than the oldest
    /// retained slot are silently ignored.
    pub fn update(&mut self, size: usize, now_ms: u64) {
        if now_ms < self.oldest_item_start_time {
            return;
        }

        self.bytes += size as u64;

        self.remove_old_data(now_ms);

        let start_new_item = match self.newest_item_index {
            None => true,
            Some(_) => now_ms - self.newest_item_start_time >= self.item_size_ms,
        };

        if start_new_item {
            let index = match self.newest_item_index {
                Some(i) => (i + 1) % self.window_items,
                None => 0,
            };
            self.newest_item_index = Some(index);
            self.newest_item_start_time = now_ms;

            // Newest index caught up with the oldest one, retire it.
            if self.oldest_item_index == Some(index) {
                warn!(
                    "calculation buffer full, window_size_ms:{} window_items:{}",
                    self.window_size_ms, self.window_items
                );

                let oldest = &mut self.buffer[index];
                self.total_count -= oldest.count;
                *oldest = BufferItem::default();
                let next_oldest = (index + 1) % self.window_items;
                self.oldest_item_index = Some(next_oldest);
                self.oldest_item_start_time = self.buffer[next_oldest].time;
            }

            self.buffer[index] = BufferItem {
                count: size as u64,
                time: now_ms,
            };
        } else {
            let index = self.newest_item_index.expect("a newest item");
            self.buffer[index].count += size as u64;
        }

        if self.oldest_item_index.is_none() {
            self.oldest_item_index = self.newest_item_index;
            self.oldest_item_start_time = now_ms;
        }

        self.total_count += size as u64;

        // Invalidate the memoized rate so the next get_rate() with the
        // same now_ms recalculates.
        self.last = None;
    }

    /// The rate over the trailing window ending at `now_ms`. Repeated
    /// calls with the same timestamp are O(1).
    pub fn get_rate(&mut self, now_ms: u64) -> u32 {
        if let Some((last_time, last_rate)) = self.last {
            if last_time == now_ms {
                return last_rate;
            }
        }

        self.remove_old_data(now_ms);

        let scale = self.scale / self.window_size_ms as f64;
        let rate = (self.total_count as f64 * scale + 0.5).trunc() as u32;

        self.last = Some((now_ms, rate));

        rate
    }

    /// Total bytes seen since creation (not windowed).
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn remove_old_data(&mut self, now_ms: u64) {
        let (Some(_), Some(_)) = (self.newest_item_index, self.oldest_item_index) else {
            return;
        };

        let new_oldest_time = now_ms.saturating_sub(self.window_size_ms);

        if new_oldest_time <= self.oldest_item_start_time {
            return;
        }

        // A whole window has elapsed since the last sample.
        if new_oldest_time > self.newest_item_start_time {
            self.reset();
            return;
        }

        while self.oldest_item_start_time < new_oldest_time {
            let index = self.oldest_item_index.expect("an oldest item");
            let oldest = &mut self.buffer[index];
            self.total_count -= oldest.count;
            *oldest = BufferItem::default();

            let next = (index + 1) % self.window_items;
            self.oldest_item_index = Some(next);
            self.oldest_item_start_time = self.buffer[next].time;
        }
    }

    fn reset(&mut self) {
        for item in &mut self.buffer {
            *item = BufferItem::default();
        }
        self.newest_item_start_time = 0;
        self.newest_item_index = None;
        self.oldest_item_start_time = 0;
        self.oldest_item_index = None;
        self.total_count = 0;
        self.last = None;
    }
}

/// Byte rate plus packet count for one direction of one entity.
#[derive(Debug, Default)]
pub struct RtpDataCounter {
    rate: RateCalculator,
    packets: u64,
}

impl RtpDataCounter {
    pub fn new() -> Self {
        RtpDataCounter::default()
    }

    pub fn update(&mut self, size: usize, now_ms: u64) {
        self.packets += 1;
        self.rate.update(size, now_ms);
    }

    pub fn get_bitrate(&mut self, now_ms: u64) -> u32 {
        self.rate.get_rate(now_ms)
    }

    pub fn packet_count(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.rate.bytes()
    }
}
