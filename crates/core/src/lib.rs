//! Core crate for shared mirage types.

pub mod config;
pub mod logging;
pub mod model;
pub mod ops;
pub mod pipeline;
pub mod progress;
pub mod tensor;
