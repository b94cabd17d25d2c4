//! HTTP server module
//!
//! - `POST /extract` runs one extraction over the request body
//! - `GET /progress` reports the shared progress value
//! - health and version endpoints
//! - CORS and request tracing middleware

pub mod handlers;
pub mod routes;

pub use routes::create_router;
