//! Foundational types for the AICentral gateway.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP
//! client. Dispatchers and selectors construct `UpstreamHttpRequest` values
//! and produce `GatewayResponse`/`UsageInformation`, while a higher layer
//! performs IO.

pub mod descriptor;
pub mod details;
pub mod error;
pub mod headers;
pub mod response;
pub mod telemetry;
pub mod upstream;
pub mod usage;

pub use descriptor::{EndpointAuth, EndpointDescriptor, EndpointKind};
pub use details::{CallDetails, CallKind, ResponseShape};
pub use error::GatewayError;
pub use headers::{Headers, header_get, header_set, header_u64};
pub use response::{GatewayResponse, StreamBody, StreamTotals};
pub use telemetry::{
    LogRecorder, NoopRecorder, SharedRecorder, TelemetryRecorder, TelemetryTags, flat_gauge_name,
};
pub use upstream::{
    HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind,
};
pub use usage::UsageInformation;
