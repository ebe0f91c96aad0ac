//! # SoundMap Common Library
//!
//! Shared code for the SoundMap crates:
//! - Error type used by configuration and bootstrap code
//! - TOML configuration loading and root folder resolution
//! - Logging bootstrap
//! - Pipeline event types and the EventBus

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
