//! Unread / total counters per user and label.

mod record;
mod store;

pub use record::{distant_past, CountMode, CounterKey, CounterRecord};
pub use store::{CounterStore, UnreadCountUpdate};
