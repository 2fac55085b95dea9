//! Shared types for the bondcast appliance.
//!
//! This crate contains:
//! - **Protocol messages** — WebSocket message types between the daemon, the
//!   browser UI, and the cloud relay
//! - **Auth primitives** — Argon2id password hashing, opaque session tokens
//! - **Data models** — setup/config documents, interface and Wi-Fi records,
//!   notifications

pub mod auth;
pub mod models;
pub mod protocol;
