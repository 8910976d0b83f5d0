//! transcode-factory library crate.
//!
//! A single-node media transcode factory: a durable SQLite job queue worked
//! by three stage dispatchers, a live notification hub and a small HTTP API.

pub mod api;
pub mod config;
pub mod database;
pub mod domain;
pub mod encoder;
pub mod error;
pub mod hub;
pub mod logging;
pub mod pipeline;

pub use error::{Error, Result};
