//! HTTP ingress for the Pocket gateway relay service.
//!
//! Thin axum layer over [`gateway_core`]: two relay routes, header capture
//! into the per-request context, and the error-to-status mapping.
//! Resolution, filtering, selection, retries, fallback, and metrics all live
//! in the core.

pub mod router;
pub mod sender;
