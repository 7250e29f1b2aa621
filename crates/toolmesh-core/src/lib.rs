//! # toolmesh-core
//!
//! Shared foundations for toolmesh.
//!
//! This crate provides:
//! - Layered configuration (defaults, TOML files, environment)
//! - Plugin registration settings
//! - Common error types

pub mod config;
pub mod error;

pub use config::{Config, PluginConfig, SessionSettings, TransportKind};
pub use error::{Error, Result};
