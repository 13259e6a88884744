//! Vexa API daemon.
//!
//! Exposes the credit ledger to external integrations over HTTP. Client
//! calls authenticate with a per-account credential and pay a fixed cost per
//! call; administrative routes are guarded by a shared secret.
//!
//! The binary in `main.rs` only parses arguments, sets up logging and serves
//! [`api::router`]; everything else lives here so integration tests can drive
//! the router directly.

pub mod api;
pub mod state;

pub use api::router;
pub use state::AppState;
