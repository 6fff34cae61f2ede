use std::{
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

/// Token-bucket throttle for flush and compaction writes. Callers request a
/// byte budget before each write and are put to sleep until the bucket
/// refills enough to cover it.
pub struct RateLimiter {
    bytes_per_second: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_second: u64) -> Self {
        assert!(bytes_per_second > 0);
        RateLimiter {
            bytes_per_second: bytes_per_second as f64,
            state: Mutex::new(BucketState {
                available: bytes_per_second as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second as u64
    }

    /// Blocks until `bytes` tokens are available, then consumes them.
    pub fn request(&self, bytes: u64) {
        let bytes = bytes as f64;
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.available =
                    (state.available + elapsed * self.bytes_per_second).min(self.bytes_per_second);
                state.last_refill = now;

                if state.available >= bytes {
                    state.available -= bytes;
                    None
                } else {
                    let deficit = bytes - state.available;
                    Some(Duration::from_secs_f64(deficit / self.bytes_per_second))
                }
            };
            match wait {
                None => return,
                // Cap a single sleep so enormous requests still make progress.
                Some(d) => thread::sleep(d.min(Duration::from_millis(100))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_requests_pass_immediately() {
        let limiter = RateLimiter::new(1_000_000);
        let start = Instant::now();
        limiter.request(1000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_sustained_requests_are_throttled() {
        let limiter = RateLimiter::new(100_000);
        // Drain the initial bucket plus one refill's worth.
        let start = Instant::now();
        for _ in 0..4 {
            limiter.request(50_000);
        }
        // 200k bytes at 100k/s, minus the 100k initial burst: >= ~0.5s.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}
