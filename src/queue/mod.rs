//! Producer Queues
//!
//! Non-blocking producer paths that sit between a publishing caller and the
//! backend client.
//!
//! # Overview
//!
//! - **RingBuffer**: bounded lock-free MPMC buffer, the storage behind the
//!   in-process queue
//! - **AsyncProducerQueue**: O(1) `enqueue` with backpressure, batched flush on a
//!   size/time dual trigger, graceful `drain`
//! - **SharedQueue**: memory-mapped mailbox shared by several OS processes, with
//!   TTL'd records and at-most-once dequeue per slot
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  enqueue  ┌────────────────────┐  flush  ┌───────────┐
//! │  publish()   │ ────────► │ AsyncProducerQueue │ ──────► │ QueueSink │
//! └──────────────┘           └────────────────────┘  batch  └───────────┘
//!
//! ┌──────────────┐  enqueue  ┌────────────────────┐ dequeue ┌───────────┐
//! │ short-lived  │ ────────► │ SharedQueue (mmap) │ ──────► │  worker   │
//! │  processes   │           └────────────────────┘  batch  └───────────┘
//! └──────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use relaybus::queue::{AsyncProducerQueue, AsyncQueueConfig};
//!
//! let queue = AsyncProducerQueue::new(AsyncQueueConfig::default()).unwrap();
//! if !queue.enqueue("app.orders", r#"{"id":"1"}"#, Some("orders".into()), None) {
//!     // Backpressure: publish synchronously, drop, or reject
//! }
//! ```

pub mod api;

mod envelope;
mod error;
mod producer;
mod ring_buffer;
mod shared;

pub use envelope::QueuedEnvelope;
pub use error::{QueueError, QueueResult};
pub use producer::{AsyncProducerQueue, AsyncQueueConfig, QueueSink, QueueStats};
pub use ring_buffer::RingBuffer;
pub use shared::{
    default_segment_path, SharedQueue, SharedQueueConfig, SharedQueueSink, SharedQueueStats,
};
