//! Per-channel FIFO, merge window, rate limit, backpressure.

mod error;
mod message;
mod message_queue;

pub use error::QueueError;
pub use message::{ImageAttachment, Message, MessageOrigin};
pub use message_queue::{scheduler_message, MessageProcessor, MessageQueue, RejectHandler, RejectReason};
