//! Serial number allocation

use std::sync::Mutex;

/// Hands out strictly increasing certificate serials.
///
/// The first value is derived from wall-clock nanoseconds shifted left by
/// 32 bits, which leaves room for many allocations in the same instant.
/// Every later call returns at least `last + 1`, and [`observe`] raises the
/// floor above serials already present in storage, so a clock that moves
/// backwards never yields a duplicate.
///
/// [`observe`]: SerialAllocator::observe
#[derive(Debug, Default)]
pub struct SerialAllocator {
    last: Mutex<u128>,
}

impl SerialAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an existing serial (decimal) so later allocations exceed it
    pub fn observe(&self, serial: &str) {
        if let Ok(value) = serial.parse::<u128>() {
            let mut last = self.lock();
            if value > *last {
                *last = value;
            }
        }
    }

    /// Allocate the next serial as a decimal string
    pub fn next(&self) -> String {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .map(|n| n.max(0) as u128)
            .unwrap_or(0);
        let candidate = now << 32;

        let mut last = self.lock();
        let next = candidate.max(last.saturating_add(1));
        *last = next;
        next.to_string()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, u128> {
        // A poisoned counter still holds a valid floor
        self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strictly_increasing() {
        let alloc = SerialAllocator::new();
        let mut prev = 0u128;
        for _ in 0..1000 {
            let s: u128 = alloc.next().parse().unwrap();
            assert!(s > prev);
            prev = s;
        }
    }

    #[test]
    fn test_observe_raises_floor() {
        let alloc = SerialAllocator::new();
        let far_future = (u128::MAX >> 2).to_string();
        alloc.observe(&far_future);
        let s: u128 = alloc.next().parse().unwrap();
        assert_eq!(s, (u128::MAX >> 2) + 1);
    }

    #[test]
    fn test_observe_ignores_garbage() {
        let alloc = SerialAllocator::new();
        alloc.observe("not-a-number");
        assert!(alloc.next().parse::<u128>().unwrap() > 0);
    }
}
