//! Host-resident container network activity collector.
//!
//! connscope consumes kernel-sourced socket lifecycle events, reconstructs
//! container-tagged connection records, and forwards periodic diffs to an
//! upstream sensor over a duplex gRPC stream, applying filtering
//! configuration pushed back over the same stream.

pub mod agent;
pub mod config;
pub mod conn;
pub mod control;
pub mod event;
pub mod export;
pub mod handlers;
pub mod report;
pub mod router;
