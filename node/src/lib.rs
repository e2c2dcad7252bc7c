//! The HTTP-facing binary's library half: configuration, logging, the
//! concrete collaborators that plug into `swap-node-core`'s traits, and the
//! axum router that exposes them (§6).

pub mod collaborators;
pub mod config;
pub mod http;
pub mod logging;
