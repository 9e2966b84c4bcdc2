//! profmon: command-line client for the profile monitor UI API.
//!
//! The RPC session itself lives in the `profmon-client` crate. This crate
//! composes it into an application:
//! - [`config`]: figment-based configuration (TOML file + `PROFMON_` env vars)
//! - [`logging`]: tracing subscriber setup
//! - [`error`]: application error type

pub mod config;
pub mod error;
pub mod logging;

pub use profmon_client as client;
