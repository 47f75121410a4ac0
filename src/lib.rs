//! xpanel - process supervision core of an Xray proxy management panel
//!
//! This library:
//! - Builds the Xray config from a stored template plus the enabled inbounds
//! - Starts, stops and restarts a single Xray subprocess, skipping restarts
//!   when the config has not changed
//! - Captures the tail of the subprocess output and its exit status
//! - Fetches per-tag traffic counters from the Xray stats gRPC API
//! - Runs periodic reconciliation, traffic collection and inbound enforcement
//! - Exposes an authenticated admin API over HTTP

pub mod admin;
pub mod config;
pub mod config_builder;
pub mod error;
pub mod jobs;
pub mod process;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod traffic;
pub mod xray_config;
