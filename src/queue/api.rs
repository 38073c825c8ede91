//! Public API for the producer queues
//!
//! External modules should import from here rather than directly from internal modules.

// In-process queue
pub use crate::queue::producer::{AsyncProducerQueue, AsyncQueueConfig, QueueSink, QueueStats};
pub use crate::queue::ring_buffer::RingBuffer;

// Cross-process queue
pub use crate::queue::shared::{default_segment_path, SharedQueue, SharedQueueConfig};

// Records and errors
pub use crate::queue::envelope::QueuedEnvelope;
pub use crate::queue::error::{QueueError, QueueResult};
