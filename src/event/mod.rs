//! Readiness events returned by one readiness-wait call.

mod event;
mod events;

pub use event::Event;
pub use events::{Events, Iter};
