//! Read-only HTTP diagnostics endpoint

pub mod handlers;
pub mod server;

pub use server::{AppState, MonitorServer};
