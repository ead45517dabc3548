#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("channel {0} queue is full")]
    Full(String),
    #[error("rate limit exceeded for user {0}")]
    RateLimited(String),
}
