//! Vigil - host and service monitoring scheduler for DaemonOS
//!
//! Provides:
//! - Dual-priority timed event scheduling with clock-jump compensation
//! - Active and passive host/service checks with soft/hard state logic
//! - Scheduled downtime, fixed and flexible, with trigger chains
//! - Comments and acknowledgements
//! - External command processing
//! - State retention and a JSON status file

pub mod broker;
pub mod checker;
pub mod checks;
pub mod clock;
pub mod command_manager;
pub mod comments;
pub mod config;
pub mod downtimes;
pub mod engine;
pub mod error;
pub mod events;
pub mod external;
pub mod objects;
pub mod retention;
pub mod status;

pub use engine::Engine;
pub use error::{EngineError, Result};
pub use events::{EventLoop, LoopHandle};
