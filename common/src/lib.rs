//! Shared types for take capture nodes and the control server.

pub mod artifact;
pub mod config;
pub mod discovery;
pub mod protocol;
