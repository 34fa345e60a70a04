/// Consecutive idle seconds, shared between the watchdog loop and the HTTP handlers.
///
/// Every operation is a single atomic access, so concurrent readers never see a
/// partially applied update and no caller ever blocks.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IdleCounter {
    value: AtomicU64,
}

impl IdleCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current idle seconds.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_starts_at_zero() {
        assert_eq!(IdleCounter::new().get(), 0);
    }

    #[test]
    fn test_increment_and_reset() {
        let counter = IdleCounter::new();
        counter.increment();
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 3);

        counter.reset();
        assert_eq!(counter.get(), 0);

        // Reset is idempotent
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let counter = Arc::new(IdleCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn test_concurrent_reset_and_read_never_exceed_increments() {
        let counter = Arc::new(IdleCounter::new());
        let writer = {
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || {
                for i in 0..5000 {
                    if i % 7 == 0 {
                        counter.reset();
                    } else {
                        counter.increment();
                    }
                }
            })
        };
        for _ in 0..5000 {
            assert!(counter.get() <= 5000);
        }
        writer.join().unwrap();
        assert!(counter.get() < 7);
    }
}
