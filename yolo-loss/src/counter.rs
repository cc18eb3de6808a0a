//! Instance id generation owned by the caller.

use crate::common::*;

/// A thread-safe counter that hands out unique instance ids.
///
/// Ids are unique among the ranges taken from the same counter. Share it by
/// reference to keep ids unique across training steps.
#[derive(Debug, Default)]
pub struct InstanceCounter {
    next: AtomicUsize,
}

impl InstanceCounter {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(start: usize) -> Self {
        Self {
            next: AtomicUsize::new(start),
        }
    }

    /// Take one id.
    pub fn next_id(&self) -> usize {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Take `count` contiguous ids.
    pub fn reserve(&self, count: usize) -> Range<usize> {
        let start = self.next.fetch_add(count, Ordering::SeqCst);
        start..(start + count)
    }

    /// The id that the next call would return.
    pub fn peek(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_disjoint() {
        let counter = InstanceCounter::starting_at(10);
        assert_eq!(counter.next_id(), 10);
        assert_eq!(counter.reserve(3), 11..14);
        assert_eq!(counter.reserve(0), 14..14);
        assert_eq!(counter.peek(), 14);
    }

    #[test]
    fn concurrent_ids_are_unique() {
        let counter = InstanceCounter::new();
        let ranges: Vec<Range<usize>> = (0..64)
            .into_par_iter()
            .map(|_| counter.reserve(4))
            .collect();
        let ids: Vec<usize> = ranges.into_iter().flatten().collect();
        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(ids.len(), 256);
        assert_eq!(unique.len(), 256);
    }
}
