//! Event scheduling: timed events, the dual-priority timeline and the
//! dispatch loop that drives them.

pub mod event_loop;
pub mod scheduling;
pub mod timed_event;
pub mod timeline;

pub use event_loop::{EventLoop, LoopHandle, Step};
pub use scheduling::{adjust_timestamp_for_time_change, next_log_rotation};
pub use timed_event::{EventId, EventPayload, EventType, Priority, TimedEvent, TimingFn, UserFunction};
pub use timeline::{EventQueue, Timeline};
