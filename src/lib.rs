//! Non-blocking TCP/TLS connection layer driven by readiness polling.
//!
//! A single driver thread owns a [net::Network] and calls its poll functions
//! on a regular cadence, optionally sleeping in [net::Network::wait] between
//! iterations. Host name resolution runs on background worker threads and is
//! polled to completion; everything else happens on the driver thread.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(not(unix))]
compile_error!("This crate is only compatible with Unix systems that support poll(2).");

pub mod config;
pub mod error;
pub mod log;
pub mod net;

pub use config::NetConfig;
pub use error::{Error, ErrorCode, Result};
