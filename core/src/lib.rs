//! Terminal session fabric: PTY driver, backend adapter, durable session
//! registry, session hub, and boot-time reconciler. No HTTP, no UI — those
//! live in the `session-manager` and `gateway` binaries.

pub mod backend;
pub mod config;
pub mod error;
pub mod hub;
pub mod pty;
pub mod reconciler;
pub mod registry;
pub mod types;
