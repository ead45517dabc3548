//! Errors the dispatcher itself raises, distinct from the subsystem errors
//! it mostly just propagates.

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("message text exceeds the 10,000 character limit")]
    TextTooLong,

    #[error("no session exists for user {0}")]
    UnknownUser(String),
}
