//! HTTP API Module
//!
//! REST API for daemon status and operator actions.

mod http;

pub use http::{
    ActionResponse, AppState, CheckResponse, ClusterResponse, ErrorResponse, HealthResponse,
    HttpServer, StatusResponse,
};
