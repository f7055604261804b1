pub mod artifacts;
pub mod config;
pub mod contributions;
pub mod dashboard;
pub mod error;
pub mod export;
pub mod metrics;
pub mod ranking;
pub mod state;
