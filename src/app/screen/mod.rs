pub mod annotate;
pub mod hashing;
pub mod tracker;

pub use tracker::{Screen, ScreenTracker, Transition};
