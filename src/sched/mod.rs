//! Thread scheduling.
//!
//! Provides the thread store and the round-robin selection policy.

pub mod rr;
pub mod store;
pub mod trait_def;

pub use rr::RoundRobinScheduler;
pub use store::TcbStore;
pub use trait_def::Scheduler;

/// Default scheduler type.
pub type DefaultScheduler = RoundRobinScheduler;
