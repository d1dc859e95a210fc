//! Real-time event hub
//!
//! Components publish typed events; subscribers filter by topic pattern and
//! receive through bounded per-subscriber queues. Publishing never blocks.

mod hub;
mod types;

pub use hub::{create_event_hub, EventHub, Subscription, DEFAULT_QUEUE_CAPACITY, MIN_QUEUE_CAPACITY};
pub use types::{topic_matches, topics, Event};
