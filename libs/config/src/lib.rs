//! # Communication Layer Configuration
//!
//! This crate provides centralized configuration management and constants
//! for the communication layer, so channel defaults live in one place.
//!
//! ## Features
//!
//! - **Wire Constants**: EOF sentinel, compound address separator
//! - **Channel Defaults**: frame sizes, timeouts, backlog polling interval
//! - **Settings Loading**: TOML files with `COMM_` environment overrides
//!
//! ## Usage
//!
//! ```rust
//! use comm_config::{comm, CommSettings};
//!
//! let settings = CommSettings::default();
//! assert_eq!(settings.max_frame_size, comm::DEFAULT_MAX_FRAME_SIZE);
//! ```

pub mod comm;
pub mod settings;

// Re-export commonly used types
pub use settings::{load_settings, CommSettings};
