//! payo-daemon library target.
//!
//! Exposes the router, state and shell adapter for integration tests.
//! The binary `main.rs` depends on this library target.

pub mod api_types;
pub mod platform;
pub mod routes;
pub mod state;
