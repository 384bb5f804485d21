//! Command handlers

pub mod config;
pub mod status;
pub mod sync;
pub mod watch;
pub mod zones;
