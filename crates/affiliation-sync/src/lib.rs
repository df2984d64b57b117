pub mod config;
pub mod error;
pub mod platform;
pub mod stores;
pub mod telemetry;
pub mod verification;
