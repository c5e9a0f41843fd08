//! # Gateway Module
//!
//! The proxy request path: request snapshots, the call pipeline, response
//! assembly and the HTTP server that ties them together.

pub mod pipeline;
pub mod request;
pub mod response;
pub mod server;

pub use pipeline::{CallPipeline, PipelineStats};
pub use request::ProxyRequest;
pub use response::{assemble, preflight, AssembleOptions, ScriptResponse, TestEnvelope};
pub use server::{build_app, GatewayServer, ProxyServices};
