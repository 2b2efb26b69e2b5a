use serde::Serialize;

use super::LogicalClock;

/// Scalar logical clock. Stamps only ever move forward, independent of wall-clock time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LamportClock(u64);

impl LamportClock {
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Advances this clock in place and returns the new stamp.
    pub fn tick(&mut self) -> Self {
        *self = self.extend();
        *self
    }
}

impl LogicalClock for LamportClock {
    fn extend(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for LamportClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use crate::order::{LamportClock, LogicalClock};

    #[test]
    fn extend_is_strictly_later() {
        let e1 = LamportClock::default();
        let e2 = e1.extend();
        assert!(e1 < e2);
        assert_eq!(e2.get(), 1);
        assert_eq!(e2.partial_cmp(&e2), Some(std::cmp::Ordering::Equal));
    }

    #[test]
    fn tick_hands_out_increasing_stamps() {
        let mut clk = LamportClock::default();
        let stamps: Vec<_> = (0..5).map(|_| clk.tick()).collect();
        assert!(stamps.iter().zip(&stamps[1..]).all(|(s, t)| s < t));
        assert_eq!(clk, *stamps.last().unwrap());
    }
}
