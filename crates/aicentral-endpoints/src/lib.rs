//! Concrete endpoint machinery for the AICentral gateway: the wreq-backed
//! upstream client, the per-endpoint dispatchers, the selector tree, the
//! streaming token tee, and the shared trackers consulted by selectors.

pub mod affinity;
pub mod client;
pub mod dispatcher;
pub mod latency;
pub mod selector;
pub mod tee;

pub use affinity::AffinityStore;
pub use client::{UpstreamClientConfig, WreqUpstreamClient};
pub use dispatcher::{DispatchContext, DispatchOutcome, EndpointDispatcher};
pub use latency::LatencyTracker;
pub use selector::{AFFINITY_HEADER, EndpointSelector, PriorityTier};
