//! Message ID generation.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Generates message IDs that are unique per process and across restarts.
///
/// IDs are a random per-generator prefix followed by a monotonically
/// increasing counter, e.g. `3f2a9c1e-17`.
#[derive(Debug)]
pub struct MessageIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self {
            prefix: uuid[..8].to_string(),
            counter: AtomicU64::new(1),
        }
    }

    /// Returns the next ID.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_unique() {
        let gen = MessageIdGenerator::new();
        let ids: HashSet<String> = (0..10_000).map(|_| gen.next_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_generators_do_not_collide() {
        let a = MessageIdGenerator::new();
        let b = MessageIdGenerator::new();
        assert_ne!(a.next_id(), b.next_id());
    }

    #[test]
    fn test_unique_across_threads() {
        let gen = Arc::new(MessageIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = gen.clone();
                std::thread::spawn(move || (0..1000).map(|_| gen.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 4000);
    }
}
