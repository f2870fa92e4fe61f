pub mod config;
pub mod metrics;
pub mod node;
pub mod pipeline;
pub mod telemetry;
