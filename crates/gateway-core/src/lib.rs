//! # Gateway Core
//!
//! Core library for the Pocket gateway relay service.
//!
//! The gateway multiplexes many client applications onto a shared pool of
//! decentralized service nodes, continuously verifying that the nodes it
//! relays to are synchronized with the chain tip and statistically reliable.
//!
//! This crate provides the foundational components for:
//!
//! - **[`cache`]**: Short-TTL key/value adapter used for application records,
//!   per-node service logs, verified node sets, and distributed probe locks.
//!
//! - **[`registry`]**: Read-only application, load balancer, and blockchain
//!   repositories with 60 second record caching.
//!
//! - **[`picker`]**: Cherry-picking node selection by rolling success rate
//!   and latency, with weighted random draws and exclusion sets.
//!
//! - **[`checks`]**: Consensus-driven sync and chain-id health filters that
//!   cache the verified subset of a session's nodes.
//!
//! - **[`dispatch`]**: The relay orchestrator tying resolution, filtering,
//!   selection, retries, fallback, and metrics together.
//!
//! - **[`metrics`]**: Per-relay metric records with service-log updates and
//!   a durable write-behind sink.
//!
//! ## Request Flow
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌──────────────┐
//! │  Registry    │ ── LB → uniform draw over verified apps
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ SyncChecker  │ ── in-sync subset (fail open)
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ ChainChecker │ ── chain-id verified subset (fail open)
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ CherryPicker │ ── tiered, latency-weighted draw
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐     failure: record metric, exclude node, retry
//! │ RelaySender  │ ──► exhausted: fallback to alt runtime URL
//! └──────┬───────┘
//!        ▼
//!   Response to Client (+ one metric record per attempt)
//! ```

pub mod cache;
pub mod checks;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod picker;
pub mod registry;
pub mod relay;
pub mod types;
