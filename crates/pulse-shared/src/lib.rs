//! # pulse-shared
//!
//! Types shared between the pulse server and its clients: identifiers,
//! presence and call enums, the JSON frame protocol spoken over the
//! WebSocket, machine-readable error codes and signed access tokens.

pub mod auth;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;
