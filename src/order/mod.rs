pub mod lamport;

pub use lamport::LamportClock;

// PartialOrd because not all clocks are comparable; scalar clocks happen to be total
pub trait LogicalClock: PartialOrd + Clone {
    /// Local event: the next stamp after `self`.
    fn extend(&self) -> Self;
}
