//! Configuration
//!
//! Config file loading, startup validation, runtime presets and shared types.

pub mod loader;
pub mod presets;
pub mod types;
pub mod validator;
