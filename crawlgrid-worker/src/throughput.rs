use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Rolling one-minute record of handled messages, owned by a single worker.
/// The current window length is published for readers on other tasks.
pub struct ThroughputWindow {
    stamps: VecDeque<Instant>,
    published: Arc<AtomicUsize>,
}

impl ThroughputWindow {
    pub fn new(published: Arc<AtomicUsize>) -> Self {
        Self {
            stamps: VecDeque::new(),
            published,
        }
    }

    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&mut self, now: Instant) {
        self.stamps.push_back(now);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.stamps.front() {
            if now.duration_since(*oldest) > THROUGHPUT_WINDOW {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        self.published.store(self.stamps.len(), Ordering::Relaxed);
    }

    pub fn messages_per_minute(&self) -> usize {
        self.stamps.len()
    }
}

/// Sum of every worker's published count.
pub fn aggregate(counters: &[Arc<AtomicUsize>]) -> usize {
    counters
        .iter()
        .map(|counter| counter.load(Ordering::Relaxed))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_older_than_a_minute_are_pruned() {
        let published = Arc::new(AtomicUsize::new(0));
        let mut window = ThroughputWindow::new(Arc::clone(&published));
        let start = Instant::now();

        window.record_at(start);
        window.record_at(start + Duration::from_secs(30));
        assert_eq!(published.load(Ordering::Relaxed), 2);

        window.record_at(start + Duration::from_secs(61));
        assert_eq!(window.messages_per_minute(), 2);
        assert_eq!(published.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn aggregate_sums_workers() {
        let counters = vec![
            Arc::new(AtomicUsize::new(3)),
            Arc::new(AtomicUsize::new(4)),
        ];
        assert_eq!(aggregate(&counters), 7);
    }
}
