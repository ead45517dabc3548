//! The unified driver: a single timer loop that fires operator cron jobs,
//! agent-managed jobs, and the two built-in projection-maintenance jobs,
//! all by enqueueing a synthetic [`Message`] rather than running agent code
//! directly. Generalized from the teacher's `tick()`-every-N-seconds loop;
//! the teacher's `JobAction::Shell`/`AgentTask`/`Delegate` variants don't
//! apply here, so every job class collapses to "emit one message".

use super::cronexpr;
use super::error::SchedulerError;
use super::model::{AgentJob, MaintenanceJob, OperatorJob};
use super::store::ScheduleStore;
use crate::config::PrimaryUserConfig;
use crate::projections::ProjectionStore;
use crate::queue::{scheduler_message, MessageQueue};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use uuid::Uuid;

const TICK_INTERVAL_SECS: u64 = 30;
const AUTO_EXPIRE_THRESHOLD_HOURS: i64 = 24;
const DAILY_REVIEW_HORIZON_DAYS: i64 = 7;
const EXACT_CHECK_WINDOW_MINUTES: i64 = 60;

pub struct SchedulerDaemon {
    store: ScheduleStore,
    operator_jobs: Vec<OperatorJob>,
    agent_jobs: DashMap<Uuid, AgentJob>,
    primary_user: PrimaryUserConfig,
    queue: Arc<MessageQueue>,
    projections: Arc<ProjectionStore>,
    operator_baseline: DashMap<usize, DateTime<Utc>>,
    maintenance_baseline: DashMap<&'static str, DateTime<Utc>>,
}

impl SchedulerDaemon {
    pub async fn new(
        store: ScheduleStore,
        operator_jobs: Vec<OperatorJob>,
        primary_user: PrimaryUserConfig,
        queue: Arc<MessageQueue>,
        projections: Arc<ProjectionStore>,
    ) -> Result<Self, SchedulerError> {
        let loaded = store.load().await?;
        let agent_jobs = DashMap::new();
        for job in loaded {
            agent_jobs.insert(job.id, job);
        }
        let now = Utc::now();
        let operator_baseline = DashMap::new();
        for (i, _) in operator_jobs.iter().enumerate() {
            operator_baseline.insert(i, now);
        }
        let maintenance_baseline = DashMap::new();
        maintenance_baseline.insert("daily_review", now);
        maintenance_baseline.insert("exact_time_check", now);

        Ok(Self {
            store,
            operator_jobs,
            agent_jobs,
            primary_user,
            queue,
            projections,
            operator_baseline,
            maintenance_baseline,
        })
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(TICK_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    #[tracing::instrument(name = "scheduler_tick", skip_all)]
    async fn tick(&self) {
        let now = Utc::now();
        self.fire_operator_jobs(now);
        self.fire_agent_jobs(now).await;
        self.fire_maintenance_jobs(now).await;
    }

    fn fire_operator_jobs(&self, now: DateTime<Utc>) {
        for (i, job) in self.operator_jobs.iter().enumerate() {
            let baseline = self
                .operator_baseline
                .get(&i)
                .map(|b| *b)
                .unwrap_or(now);
            match cronexpr::next_after(&job.cron_expression, baseline) {
                Ok(Some(next)) if next <= now => {
                    self.operator_baseline.insert(i, now);
                    self.enqueue(&job.message);
                }
                Ok(_) => {}
                Err(e) => warn!(expression = %job.cron_expression, error = %e, "operator cron job has an invalid expression"),
            }
        }
    }

    async fn fire_agent_jobs(&self, now: DateTime<Utc>) {
        let due: Vec<AgentJob> = self
            .agent_jobs
            .iter()
            .filter(|entry| {
                let job = entry.value();
                let baseline = job.last_fired_at.unwrap_or(job.created_at);
                matches!(cronexpr::next_after(&job.cron_expression, baseline), Ok(Some(next)) if next <= now)
            })
            .map(|entry| entry.value().clone())
            .collect();

        for job in due {
            let message = scheduler_message(job.channel_id.clone(), job.user_id.clone(), job.message.clone(), job.platform.clone());
            self.queue.enqueue(message);
            if let Some(mut entry) = self.agent_jobs.get_mut(&job.id) {
                entry.last_fired_at = Some(now);
            }
            if let Err(e) = self.store.mark_fired(job.id, now).await {
                warn!(job_id = %job.id, error = %e, "failed to persist agent job fire timestamp");
            }
        }
    }

    async fn fire_maintenance_jobs(&self, now: DateTime<Utc>) {
        self.fire_daily_review(now).await;
        self.fire_exact_time_check(now).await;
    }

    async fn fire_daily_review(&self, now: DateTime<Utc>) {
        let baseline = self.maintenance_baseline.get("daily_review").map(|b| *b).unwrap_or(now);
        let due = matches!(
            cronexpr::next_after(MaintenanceJob::DailyReview.cron_expression(), baseline),
            Ok(Some(next)) if next <= now
        );
        if !due {
            return;
        }
        self.maintenance_baseline.insert("daily_review", now);

        match self.projections.auto_expire(AUTO_EXPIRE_THRESHOLD_HOURS).await {
            Ok(expired) if expired > 0 => info!(count = expired, "auto-expired stale projections before daily review"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "daily review auto-expire failed"),
        }

        match self.projections.get_upcoming(DAILY_REVIEW_HORIZON_DAYS).await {
            Ok(projections) if !projections.is_empty() => {
                let list = render_projection_list(&projections);
                self.enqueue(&format!(
                    "Daily review: here is everything due in the next {DAILY_REVIEW_HORIZON_DAYS} days. \
                     Decide per item whether to act now, remind later, or leave pending.\n{list}"
                ));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "daily review fetch-upcoming failed"),
        }
    }

    async fn fire_exact_time_check(&self, now: DateTime<Utc>) {
        let baseline = self.maintenance_baseline.get("exact_time_check").map(|b| *b).unwrap_or(now);
        let due = matches!(
            cronexpr::next_after(MaintenanceJob::ExactTimeCheck.cron_expression(), baseline),
            Ok(Some(next)) if next <= now
        );
        if !due {
            return;
        }
        self.maintenance_baseline.insert("exact_time_check", now);

        match self.projections.get_exact_due(EXACT_CHECK_WINDOW_MINUTES).await {
            Ok(projections) if !projections.is_empty() => {
                let list = render_projection_list(&projections);
                self.enqueue(&format!("These are due within the hour:\n{list}"));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "exact-time check failed"),
        }
    }

    fn enqueue(&self, text: &str) {
        let message = scheduler_message(
            self.primary_user.channel_id.clone(),
            self.primary_user.user_id.clone(),
            text.to_string(),
            self.primary_user.platform.clone(),
        );
        self.queue.enqueue(message);
    }

    /// `schedule_create`: fails fast on an invalid expression; only
    /// persisted once the job is live in memory.
    pub async fn create_job(
        &self,
        user_id: &str,
        channel_id: &str,
        platform: &str,
        cron_expression: &str,
        message: &str,
        timezone: &str,
    ) -> Result<Uuid, SchedulerError> {
        cronexpr::validate(cron_expression)?;
        let job = AgentJob::new(user_id, channel_id, platform, cron_expression, message, timezone);
        let id = job.id;
        self.agent_jobs.insert(id, job.clone());
        if let Err(e) = self.store.insert(job).await {
            self.agent_jobs.remove(&id);
            return Err(SchedulerError::Io(e));
        }
        Ok(id)
    }

    /// `schedule_list`.
    pub fn list_jobs(&self, user_id: &str) -> Vec<AgentJob> {
        self.agent_jobs.iter().filter(|e| e.value().user_id == user_id).map(|e| e.value().clone()).collect()
    }

    /// `schedule_delete`.
    pub async fn delete_job(&self, id: Uuid) -> Result<bool, SchedulerError> {
        self.agent_jobs.remove(&id);
        Ok(self.store.remove(id).await?)
    }
}

fn render_projection_list(projections: &[crate::projections::Projection]) -> String {
    projections
        .iter()
        .map(|p| format!("- {} ({})", p.summary, p.raw_when.as_deref().unwrap_or("unspecified time")))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Message, MessageProcessor, RejectHandler, RejectReason};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    struct CollectingProcessor {
        received: Arc<SyncMutex<Vec<Message>>>,
    }

    #[async_trait]
    impl MessageProcessor for CollectingProcessor {
        async fn process(&self, message: Message) -> anyhow::Result<()> {
            self.received.lock().push(message);
            Ok(())
        }
    }

    struct NoopReject;
    impl RejectHandler for NoopReject {
        fn on_reject(&self, _message: &Message, _reason: RejectReason) {}
    }

    #[tokio::test]
    async fn create_list_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let received = Arc::new(SyncMutex::new(Vec::new()));
        let queue = Arc::new(MessageQueue::new(
            Arc::new(CollectingProcessor { received: received.clone() }),
            Arc::new(NoopReject),
            50,
        ));
        let db_path = dir.path().join("projections.sqlite");
        let projections = Arc::new(ProjectionStore::open(&db_path).await.unwrap());

        let daemon = SchedulerDaemon::new(
            ScheduleStore::new(dir.path()),
            Vec::new(),
            PrimaryUserConfig::default(),
            queue,
            projections,
        )
        .await
        .unwrap();

        let id = daemon.create_job("u1", "c1", "console", "0 9 * * *", "morning", "UTC").await.unwrap();
        assert_eq!(daemon.list_jobs("u1").len(), 1);
        assert!(daemon.delete_job(id).await.unwrap());
        assert!(daemon.list_jobs("u1").is_empty());
    }

    #[tokio::test]
    async fn create_job_rejects_invalid_cron() {
        let dir = tempfile::tempdir().unwrap();
        let received = Arc::new(SyncMutex::new(Vec::new()));
        let queue = Arc::new(MessageQueue::new(
            Arc::new(CollectingProcessor { received }),
            Arc::new(NoopReject),
            50,
        ));
        let db_path = dir.path().join("projections.sqlite");
        let projections = Arc::new(ProjectionStore::open(&db_path).await.unwrap());
        let daemon = SchedulerDaemon::new(
            ScheduleStore::new(dir.path()),
            Vec::new(),
            PrimaryUserConfig::default(),
            queue,
            projections,
        )
        .await
        .unwrap();

        let result = daemon.create_job("u1", "c1", "console", "not a cron", "hi", "UTC").await;
        assert!(result.is_err());
        assert!(daemon.list_jobs("u1").is_empty());
    }
}
