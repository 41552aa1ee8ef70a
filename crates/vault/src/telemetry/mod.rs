//! Tracing setup: structured JSON logs, with spans optionally exported over
//! OTLP/gRPC.
//!
//! # Telemetry invariants
//!
//! - **No secret payloads or key material** may appear in any span attribute
//!   or log field. Records are identified by SDB id, path, scope and key id.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`) and
//!   overridable with `RUST_LOG`.
//! - Audit facts are emitted on the `audit` target and can be routed
//!   separately by filter.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
