//! # tabwatch-server
//!
//! Axum HTTP + `WebSocket` surface for tab presence telemetry.
//!
//! - `POST /telemetry` ingestion pipeline with idempotency and heartbeat coalescing
//! - Real-time subscriber fan-out (`full_snapshot`, `session_update`, `ping`)
//! - Subscriber and health watchdogs, stale-session pruning, write-queue drain
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod client;
pub mod ingest;
pub mod maintenance;
pub mod notify;
pub mod server;
pub mod watchdog;

pub use ingest::{IngestReply, TelemetryPipeline};
pub use server::{build_router, start, AppState, ServerHandle};
