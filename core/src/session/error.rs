#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to load session for user {user_id}: {source}")]
    LoadFailed {
        user_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("prompt failed against every model in the fallback chain: {0}")]
    PromptFailed(anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
