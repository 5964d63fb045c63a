use std::time::Duration;

use rand::Rng;

/// First backoff interval of a retry loop.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(25);

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Randomized exponential backoff: each delay is uniform in `[0, interval)`
/// and the interval doubles after every call.
#[derive(Debug, Clone)]
pub struct Backoff {
    interval: Duration,
}

impl Backoff {
    pub fn new(initial: Duration) -> Self {
        Self { interval: initial }
    }

    pub fn next_delay(&mut self) -> Duration {
        let upper = self.interval.as_millis().max(1) as u64;
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..upper));
        self.interval = (self.interval * 2).min(MAX_BACKOFF);
        delay
    }

    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF)
    }
}
