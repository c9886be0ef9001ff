use dashmap::DashMap;
use livecast_sfu::ConnectionId;
use std::time::Duration;
use tokio::time::Instant;

/// Round a wait up to whole seconds, never reporting less than one
pub(crate) fn retry_seconds(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

/// Messages sent by one connection inside the current window
#[derive(Debug, Clone, Copy)]
struct RateLimitRecord {
    count: u32,
    window_start: Instant,
}

/// Fixed-window limiter for chat messages, one record per connection.
///
/// Windows are checked lazily on access; `purge_expired` only reclaims memory.
pub struct MessageRateLimiter {
    max_messages: u32,
    window: Duration,
    records: DashMap<ConnectionId, RateLimitRecord>,
}

impl MessageRateLimiter {
    #[must_use]
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            max_messages,
            window,
            records: DashMap::new(),
        }
    }

    /// Count one message against the sender's quota.
    ///
    /// Returns the seconds to wait when the quota is used up.
    pub fn check(&self, connection_id: &ConnectionId) -> Result<(), u64> {
        let now = Instant::now();
        let mut record = self
            .records
            .entry(connection_id.clone())
            .or_insert(RateLimitRecord {
                count: 0,
                window_start: now,
            });

        let elapsed = now.duration_since(record.window_start);
        if elapsed >= self.window {
            record.count = 0;
            record.window_start = now;
        } else if record.count >= self.max_messages {
            return Err(retry_seconds(self.window - elapsed));
        }

        record.count += 1;
        Ok(())
    }

    pub fn clear(&self, connection_id: &ConnectionId) {
        self.records.remove(connection_id);
    }

    /// Drop records whose window has elapsed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, r| now.duration_since(r.window_start) < self.window);
        before.saturating_sub(self.records.len())
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.records.len()
    }
}
