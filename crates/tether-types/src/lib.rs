//! Wire model shared between the sync engine and its observers.

pub mod entity;
pub mod event;

pub use entity::*;
pub use event::{EventPayload, ServerEvent};
