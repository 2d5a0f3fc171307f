//! Domain model (IDs, actions, tasks, results, lane state, errors, events).

pub mod action;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;

pub use action::{CardKind, ContactCard, NotificationKind, Routing, TaskAction};
pub use errors::QueueError;
pub use events::QueueEvent;
pub use ids::{LabelId, TaskId, UserId};
pub use outcome::{ResultAction, TaskResult};
pub use state::{BlockReason, Lane, LaneState};
pub use task::QueuedTask;
