//! The AICentral pipeline engine: request classification, consumer auth,
//! the limiter steps, and the per-request driver that chains them in front
//! of an endpoint selector.

pub mod auth;
pub mod classify;
pub mod config;
pub mod pipeline;
pub mod steps;

pub use auth::{AuthContext, AuthProvider, ClientEntry, KeySnapshot, MemoryAuth, NoopAuth};
pub use classify::classify_request;
pub use config::{GatewayConfig, PipelineConfig, build_pipeline, build_pipelines};
pub use pipeline::Pipeline;
pub use steps::{PartitionMode, Step, StepTicket};
