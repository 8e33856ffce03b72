//! Event bus - per-task history and subscriber fan-out
//!
//! Every report task owns a bounded event history plus a set of live
//! subscribers. SSE clients replay missed events through the history, then
//! follow the live feed; ids are strictly increasing per task.

mod bus;
mod types;

pub use bus::{
    DEFAULT_HISTORY_CAPACITY, DEFAULT_TERMINAL_GRACE, EventBus, SUBSCRIBER_QUEUE_CAPACITY,
    create_event_bus,
};
pub use types::{Event, EventKind};
