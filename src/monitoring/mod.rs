//! Monitoring Module
//!
//! Turns raw observations into the numbers a run view shows.
//!
//! # Components
//!
//! - [`StepTimers`]: per-step elapsed time, frozen once a step stops
//! - [`ProgressTracker`]: log-derived `completed/total` with ETA
//! - [`RateEstimator`]: per-peer throughput from cumulative byte counters
//! - [`labels`]: display strings for all of the above

pub mod labels;
pub mod progress;
pub mod timeline;
pub mod transport;

pub use labels::Freshness;
pub use progress::{extract_progress, Eta, ProgressSample, ProgressTracker};
pub use timeline::{StepTimer, StepTimers};
pub use transport::{
    ChannelState, PeerByteSample, PeerChannelSample, PeerRate, RateEstimator, TransportSnapshot,
};
