//! Predictive dialer: control law plus the per-campaign engine.

pub mod control;
pub mod engine;

pub use control::{DialerConfig, DialerOrchestrator, DialingHealth, DialingHealthStatus};
pub use engine::{DialerEngine, DialerError, TickReport};
