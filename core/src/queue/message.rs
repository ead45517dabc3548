//! The transient message type that flows from a channel bridge through the
//! queue to the dispatcher.

use chrono::{DateTime, Utc};

/// Distinguishes a real user message from a synthetic one the runtime
/// injected itself. Anything with a non-`None` origin bypasses the rate
/// limiter and does not update the dispatcher's "last user message" clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    Scheduler,
    WorkerTrigger,
    ApprovalResponse,
}

#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub url_or_path: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub channel_id: String,
    pub user_id: String,
    pub text: String,
    pub platform: String,
    pub arrived_at: DateTime<Utc>,
    pub images: Vec<ImageAttachment>,
    pub origin: Option<MessageOrigin>,
}

impl Message {
    pub fn new_user(channel_id: impl Into<String>, user_id: impl Into<String>, text: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            text: text.into(),
            platform: platform.into(),
            arrived_at: Utc::now(),
            images: Vec::new(),
            origin: None,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.origin.is_some()
    }
}
