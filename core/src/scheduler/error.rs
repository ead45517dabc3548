#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expression}': {source}")]
    InvalidCron { expression: String, source: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
