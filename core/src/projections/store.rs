//! Durable per-user store of future commitments, their dependency DAG, and
//! trigger evaluation. Backed by SQLite (WAL mode) through `tokio-rusqlite`
//! so the blocking SQLite calls never stall other channels' drain loops --
//! the same non-blocking-with-respect-to-other-channels rule the rest of
//! the runtime follows for LLM calls and filesystem I/O.

use super::dag;
use super::error::{InvariantError, ProjectionError};
use super::model::{
    ConditionType, NewProjection, Projection, ProjectionDependency, ProjectionStatus, Resolution,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use uuid::Uuid;

const TS_FMT: &str = "%Y-%m-%d %H:%M:%S%.f";

fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.format(TS_FMT).to_string()
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, TS_FMT)
        .ok()
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// Optional semantic-similarity capability. Absent when the embedding model
/// is not configured; `check_triggers` then falls back to keyword-only
/// matching.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn identifier_pattern() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)w-[0-9a-f]{6,}|[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap()
    })
}

fn tokenize(trigger: &str) -> Vec<String> {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"[A-Za-z0-9]+").unwrap());
    re.find_iter(trigger).map(|m| m.as_str().to_lowercase()).collect()
}

pub struct ProjectionStore {
    conn: tokio_rusqlite::Connection,
}

impl ProjectionStore {
    pub async fn open(path: &Path) -> Result<Self, ProjectionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProjectionError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
            })?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 CREATE TABLE IF NOT EXISTS projections (
                    id TEXT PRIMARY KEY,
                    summary TEXT NOT NULL,
                    raw_when TEXT,
                    resolved_when TEXT,
                    resolution TEXT NOT NULL,
                    recurrence TEXT,
                    trigger_on_fact TEXT,
                    context TEXT,
                    linked_ids TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    resolved_at TEXT
                 );
                 CREATE TABLE IF NOT EXISTS projection_dependencies (
                    id TEXT PRIMARY KEY,
                    observer_id TEXT NOT NULL,
                    subject_id TEXT NOT NULL,
                    condition TEXT NOT NULL,
                    condition_type TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS reflection_meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_projections_status ON projections(status);
                 CREATE INDEX IF NOT EXISTS idx_deps_observer ON projection_dependencies(observer_id);
                 CREATE INDEX IF NOT EXISTS idx_deps_subject ON projection_dependencies(subject_id);",
            )?;
            // Additive migrations: ignore "duplicate column" errors so older
            // databases pick up new columns without a migration framework.
            for stmt in [
                "ALTER TABLE projections ADD COLUMN context TEXT",
                "ALTER TABLE projections ADD COLUMN linked_ids TEXT NOT NULL DEFAULT '[]'",
            ] {
                let _ = conn.execute(stmt, []);
            }
            Ok::<_, rusqlite::Error>(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn close(self) -> Result<(), ProjectionError> {
        self.conn
            .close()
            .await
            .map_err(|(_, e)| ProjectionError::Sqlite(e))
    }

    /// Atomically inserts the projection row and all requested dependency
    /// rows. Each dependency is validated against the invariants before any
    /// write happens.
    pub async fn add(&self, new: NewProjection) -> Result<Uuid, ProjectionError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let resolution = new.resolution.unwrap_or_default();
        let linked_ids = serde_json::to_string(&new.linked_ids).unwrap_or_else(|_| "[]".into());
        let depends_on = new.depends_on;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                if !depends_on.is_empty() {
                    validate_dependencies(&tx, id, &depends_on)?;
                }

                tx.execute(
                    "INSERT INTO projections
                        (id, summary, raw_when, resolved_when, resolution, recurrence,
                         trigger_on_fact, context, linked_ids, status, created_at, resolved_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10, NULL)",
                    params![
                        id.to_string(),
                        new.summary,
                        new.raw_when,
                        new.resolved_when.map(fmt_ts),
                        resolution.as_str(),
                        new.recurrence,
                        new.trigger_on_fact,
                        new.context,
                        linked_ids,
                        fmt_ts(created_at),
                    ],
                )?;

                for dep in &depends_on {
                    let condition_type = dep
                        .condition_type
                        .unwrap_or_else(|| ConditionType::infer(&dep.condition));
                    tx.execute(
                        "INSERT INTO projection_dependencies
                            (id, observer_id, subject_id, condition, condition_type, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            Uuid::new_v4().to_string(),
                            id.to_string(),
                            dep.subject_id.to_string(),
                            dep.condition,
                            condition_type.as_str(),
                            fmt_ts(created_at),
                        ],
                    )?;
                }

                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(wrap_tx_error)?;

        Ok(id)
    }

    pub async fn get_upcoming(&self, horizon_days: i64) -> Result<Vec<Projection>, ProjectionError> {
        let cutoff = fmt_ts(Utc::now() + ChronoDuration::days(horizon_days));
        let mut rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM projections WHERE status = 'pending'
                     AND (resolution = 'someday' OR resolved_when IS NULL OR resolved_when <= ?1)",
                )?;
                let rows = stmt
                    .query_map(params![cutoff], row_to_projection)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(rows)
            })
            .await?;

        rows.sort_by(|a, b| match (a.resolved_when, b.resolved_when) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        Ok(rows)
    }

    pub async fn get_exact_due(&self, window_minutes: i64) -> Result<Vec<Projection>, ProjectionError> {
        let now = Utc::now();
        let lower = fmt_ts(now - ChronoDuration::minutes(10));
        let upper = fmt_ts(now + ChronoDuration::minutes(window_minutes));
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM projections WHERE status = 'pending' AND resolution = 'exact'
                     AND resolved_when > ?1 AND resolved_when <= ?2",
                )?;
                let rows = stmt
                    .query_map(params![lower, upper], row_to_projection)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn resolve(&self, id: Uuid, status: ProjectionStatus) -> Result<bool, ProjectionError> {
        let now = fmt_ts(Utc::now());
        let affected = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE projections SET status = ?1, resolved_at = ?2
                     WHERE id = ?3 AND status = 'pending'",
                    params![status.as_str(), now, id.to_string()],
                )
            })
            .await?;
        Ok(affected > 0)
    }

    /// Re-enters pending with a new `resolved_when`. Only legal after a
    /// recurring projection has fired and been explicitly marked `done`.
    pub async fn rearm(&self, id: Uuid, next_resolved_when: DateTime<Utc>) -> Result<bool, ProjectionError> {
        let next = fmt_ts(next_resolved_when);
        let affected = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE projections SET status = 'pending', resolved_when = ?1,
                     resolution = 'exact', resolved_at = NULL
                     WHERE id = ?2 AND status = 'done' AND recurrence IS NOT NULL",
                    params![next, id.to_string()],
                )
            })
            .await?;
        Ok(affected > 0)
    }

    /// Two-phase fact matching against all pending, trigger-bearing
    /// projections. Phase 1 is a cheap substring/tokenize pass; phase 2
    /// (only run when `embedder` is supplied) falls back to cosine
    /// similarity for triggers that don't look like a worker/UUID
    /// identifier.
    pub async fn check_triggers(
        &self,
        fact_content: &str,
        embedder: Option<&dyn Embedder>,
        similarity_threshold: f32,
    ) -> Result<Vec<Projection>, ProjectionError> {
        let fact_lower = fact_content.to_lowercase();
        let candidates = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM projections WHERE status = 'pending'
                     AND trigger_on_fact IS NOT NULL AND trigger_on_fact != ''",
                )?;
                let rows = stmt
                    .query_map([], row_to_projection)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(rows)
            })
            .await?;

        let mut activated = Vec::new();
        let mut slow_path_candidates = Vec::new();

        for proj in candidates {
            let trigger = proj.trigger_on_fact.clone().unwrap_or_default();
            let tokens = tokenize(&trigger);
            let matched = !tokens.is_empty() && tokens.iter().all(|t| fact_lower.contains(t.as_str()));
            if matched {
                activated.push(proj);
            } else if !identifier_pattern().is_match(&trigger) {
                slow_path_candidates.push(proj);
            }
        }

        if let Some(embedder) = embedder {
            if !slow_path_candidates.is_empty() {
                let fact_embedding = embedder.embed(fact_content).await.ok();
                if let Some(fact_embedding) = fact_embedding {
                    for proj in slow_path_candidates {
                        let trigger = proj.trigger_on_fact.clone().unwrap_or_default();
                        if let Ok(trigger_embedding) = embedder.embed(&trigger).await {
                            if cosine_similarity(&fact_embedding, &trigger_embedding) >= similarity_threshold {
                                activated.push(proj);
                            }
                        }
                    }
                }
            }
        }

        let now = Utc::now();
        let ids: Vec<Uuid> = activated.iter().map(|p| p.id).collect();
        if !ids.is_empty() {
            let now_str = fmt_ts(now);
            self.conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    for id in &ids {
                        tx.execute(
                            "UPDATE projections SET resolved_when = ?1, resolution = 'exact',
                             trigger_on_fact = NULL WHERE id = ?2",
                            params![now_str, id.to_string()],
                        )?;
                    }
                    tx.commit()?;
                    Ok::<_, rusqlite::Error>(())
                })
                .await?;
        }

        for proj in &mut activated {
            proj.resolved_when = Some(now);
            proj.resolution = Resolution::Exact;
            proj.trigger_on_fact = None;
        }
        Ok(activated)
    }

    /// Sweeper: pending, non-`someday` projections whose `resolved_when` has
    /// aged past the expiry window become `passed`. Exact projections use a
    /// fixed 1-hour window (already fired or missed); everything else uses
    /// `threshold_hours`.
    pub async fn auto_expire(&self, threshold_hours: i64) -> Result<i64, ProjectionError> {
        let now = Utc::now();
        let exact_cutoff = fmt_ts(now - ChronoDuration::hours(1));
        let other_cutoff = fmt_ts(now - ChronoDuration::hours(threshold_hours));
        let affected = self
            .conn
            .call(move |conn| {
                let n1 = conn.execute(
                    "UPDATE projections SET status = 'passed'
                     WHERE status = 'pending' AND resolution = 'exact'
                     AND resolved_when IS NOT NULL AND resolved_when < ?1",
                    params![exact_cutoff],
                )?;
                let n2 = conn.execute(
                    "UPDATE projections SET status = 'passed'
                     WHERE status = 'pending' AND resolution != 'exact' AND resolution != 'someday'
                     AND resolved_when IS NOT NULL AND resolved_when < ?1",
                    params![other_cutoff],
                )?;
                Ok::<_, rusqlite::Error>((n1 + n2) as i64)
            })
            .await?;
        Ok(affected)
    }

    pub async fn link_dependency(
        &self,
        observer_id: Uuid,
        subject_id: Uuid,
        condition: String,
        condition_type: Option<ConditionType>,
    ) -> Result<Uuid, ProjectionError> {
        let id = Uuid::new_v4();
        let created_at = fmt_ts(Utc::now());
        let condition_type = condition_type.unwrap_or_else(|| ConditionType::infer(&condition));
        let dep = super::model::NewDependency {
            subject_id,
            condition: condition.clone(),
            condition_type: Some(condition_type),
        };

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                validate_dependencies(&tx, observer_id, std::slice::from_ref(&dep))?;
                tx.execute(
                    "INSERT INTO projection_dependencies
                        (id, observer_id, subject_id, condition, condition_type, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id.to_string(),
                        observer_id.to_string(),
                        subject_id.to_string(),
                        condition,
                        condition_type.as_str(),
                        created_at,
                    ],
                )?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(wrap_tx_error)?;

        Ok(id)
    }

    /// Fixed-point loop (<=10 iterations): activates every pending observer
    /// whose dependencies are all satisfied, removing their dependency rows,
    /// until a pass produces zero activations.
    pub async fn evaluate_dependencies(&self) -> Result<i64, ProjectionError> {
        let mut total = 0i64;
        for _ in 0..10 {
            let activated = self
                .conn
                .call(|conn| {
                    let tx = conn.transaction()?;

                    let mut observer_stmt = tx.prepare(
                        "SELECT DISTINCT observer_id FROM projection_dependencies",
                    )?;
                    let observer_ids: Vec<String> = observer_stmt
                        .query_map([], |r| r.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    drop(observer_stmt);

                    let mut activated_this_pass = 0i64;
                    for observer_id in observer_ids {
                        let is_pending: Option<String> = tx
                            .query_row(
                                "SELECT status FROM projections WHERE id = ?1",
                                params![observer_id],
                                |r| r.get(0),
                            )
                            .optional()?;
                        if is_pending.as_deref() != Some("pending") {
                            continue;
                        }

                        let mut dep_stmt = tx.prepare(
                            "SELECT subject_id, condition, condition_type FROM projection_dependencies
                             WHERE observer_id = ?1",
                        )?;
                        let deps: Vec<(String, String, String)> = dep_stmt
                            .query_map(params![observer_id], |r| {
                                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                            })?
                            .collect::<Result<Vec<_>, _>>()?;
                        drop(dep_stmt);

                        if deps.is_empty() {
                            continue;
                        }

                        let mut all_satisfied = true;
                        for (subject_id, condition, condition_type) in &deps {
                            let satisfied = if condition_type == "status_change" {
                                let subject_status: Option<String> = tx
                                    .query_row(
                                        "SELECT status FROM projections WHERE id = ?1",
                                        params![subject_id],
                                        |r| r.get(0),
                                    )
                                    .optional()?;
                                subject_status.as_deref() == Some(condition.as_str())
                            } else {
                                false // `llm` condition type never evaluates to true (unimplemented).
                            };
                            if !satisfied {
                                all_satisfied = false;
                                break;
                            }
                        }

                        if all_satisfied {
                            let now = fmt_ts(Utc::now());
                            tx.execute(
                                "UPDATE projections SET resolved_when = ?1, resolution = 'exact'
                                 WHERE id = ?2",
                                params![now, observer_id],
                            )?;
                            tx.execute(
                                "DELETE FROM projection_dependencies WHERE observer_id = ?1",
                                params![observer_id],
                            )?;
                            activated_this_pass += 1;
                        }
                    }

                    tx.commit()?;
                    Ok::<_, rusqlite::Error>(activated_this_pass)
                })
                .await?;

            total += activated;
            if activated == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Reads a single value out of `reflection_meta`, e.g. the last
    /// reflection-pass timestamp.
    pub async fn get_meta(&self, key: &str) -> Result<Option<String>, ProjectionError> {
        let key = key.to_string();
        let value = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT value FROM reflection_meta WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        Ok(value)
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<(), ProjectionError> {
        let key = key.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO reflection_meta (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn get_dependencies(
        &self,
        observer_id: Option<Uuid>,
    ) -> Result<Vec<ProjectionDependency>, ProjectionError> {
        let rows = self
            .conn
            .call(move |conn| {
                let rows = match observer_id {
                    Some(id) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, observer_id, subject_id, condition, condition_type, created_at
                             FROM projection_dependencies WHERE observer_id = ?1",
                        )?;
                        stmt.query_map(params![id.to_string()], row_to_dependency)?
                            .collect::<Result<Vec<_>, _>>()?
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, observer_id, subject_id, condition, condition_type, created_at
                             FROM projection_dependencies",
                        )?;
                        stmt.query_map([], row_to_dependency)?
                            .collect::<Result<Vec<_>, _>>()?
                    }
                };
                Ok::<_, rusqlite::Error>(rows)
            })
            .await?;
        Ok(rows)
    }
}

/// Validates a batch of new dependencies for `observer_id` against the
/// existing graph plus each other, inside an open transaction.
fn validate_dependencies(
    tx: &rusqlite::Transaction<'_>,
    observer_id: Uuid,
    deps: &[super::model::NewDependency],
) -> Result<(), rusqlite::Error> {
    let mut stmt = tx.prepare("SELECT observer_id, subject_id FROM projection_dependencies")?;
    let mut existing: Vec<(Uuid, Uuid)> = stmt
        .query_map([], |r| {
            let o: String = r.get(0)?;
            let s: String = r.get(1)?;
            Ok((
                Uuid::parse_str(&o).unwrap_or_default(),
                Uuid::parse_str(&s).unwrap_or_default(),
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    for dep in deps {
        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM projections WHERE id = ?1",
                params![dep.subject_id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(sqlite_invariant(InvariantError::MissingSubject(dep.subject_id)));
        }
        let condition_type = dep
            .condition_type
            .unwrap_or_else(|| ConditionType::infer(&dep.condition));
        if condition_type == ConditionType::Llm {
            return Err(sqlite_invariant(InvariantError::UnimplementedConditionType));
        }
        dag::validate_new_edge(&existing, observer_id, dep.subject_id)
            .map_err(sqlite_invariant)?;
        existing.push((observer_id, dep.subject_id));
    }
    Ok(())
}

/// `rusqlite::Transaction` callbacks must return `rusqlite::Error`; invariant
/// failures are smuggled through as a custom SQLite error code and unwrapped
/// again once the transaction finishes.
fn sqlite_invariant(err: InvariantError) -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
        Some(format!("__invariant__:{err}")),
    )
}

fn wrap_tx_error(err: tokio_rusqlite::Error) -> ProjectionError {
    if let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(_, Some(msg))) = &err {
        if let Some(rest) = msg.strip_prefix("__invariant__:") {
            let invariant = if rest.contains("cycle") {
                InvariantError::Cycle
            } else if rest.contains("deeper than 5") {
                InvariantError::DepthExceeded
            } else if rest.contains("itself") {
                InvariantError::SelfDependency
            } else if rest.contains("not implemented") {
                InvariantError::UnimplementedConditionType
            } else {
                let id = rest
                    .rsplit(' ')
                    .find_map(|tok| Uuid::parse_str(tok).ok())
                    .unwrap_or_else(Uuid::nil);
                InvariantError::MissingSubject(id)
            };
            return ProjectionError::Invariant(invariant);
        }
    }
    ProjectionError::Db(err)
}

fn row_to_projection(row: &Row) -> rusqlite::Result<Projection> {
    let id: String = row.get("id")?;
    let resolved_when: Option<String> = row.get("resolved_when")?;
    let resolution: String = row.get("resolution")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let resolved_at: Option<String> = row.get("resolved_at")?;
    let linked_ids: String = row.get("linked_ids")?;

    Ok(Projection {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        summary: row.get("summary")?,
        raw_when: row.get("raw_when")?,
        resolved_when: resolved_when.and_then(|s| parse_ts(&s)),
        resolution: resolution.parse().unwrap_or(Resolution::Someday),
        recurrence: row.get("recurrence")?,
        trigger_on_fact: row.get("trigger_on_fact")?,
        context: row.get("context")?,
        linked_ids: serde_json::from_str::<Vec<Uuid>>(&linked_ids).unwrap_or_default(),
        status: status.parse().unwrap_or(ProjectionStatus::Pending),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        resolved_at: resolved_at.and_then(|s| parse_ts(&s)),
    })
}

fn row_to_dependency(row: &Row) -> rusqlite::Result<ProjectionDependency> {
    let id: String = row.get(0)?;
    let observer_id: String = row.get(1)?;
    let subject_id: String = row.get(2)?;
    let condition: String = row.get(3)?;
    let condition_type: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(ProjectionDependency {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        observer_id: Uuid::parse_str(&observer_id).unwrap_or_default(),
        subject_id: Uuid::parse_str(&subject_id).unwrap_or_default(),
        condition,
        condition_type: condition_type.parse().unwrap_or(ConditionType::Llm),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projections::model::NewDependency;

    async fn test_store() -> ProjectionStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        std::mem::forget(dir); // keep tempdir alive for the test's duration
        ProjectionStore::open(&path).await.unwrap()
    }

    #[tokio::test]
    async fn add_and_resolve_roundtrip() {
        let store = test_store().await;
        let id = store
            .add(NewProjection {
                summary: "call dentist".into(),
                resolution: Some(Resolution::Day),
                ..Default::default()
            })
            .await
            .unwrap();

        let upcoming = store.get_upcoming(30).await.unwrap();
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].id, id);

        assert!(store.resolve(id, ProjectionStatus::Done).await.unwrap());
        assert!(!store.resolve(id, ProjectionStatus::Done).await.unwrap());
    }

    #[tokio::test]
    async fn dependency_cycle_is_rejected() {
        let store = test_store().await;
        let a = store
            .add(NewProjection {
                summary: "a".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let b = store
            .add(NewProjection {
                summary: "b".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        store.link_dependency(a, b, "done".into(), None).await.unwrap();
        let err = store.link_dependency(b, a, "done".into(), None).await;
        assert!(matches!(
            err,
            Err(ProjectionError::Invariant(InvariantError::Cycle))
        ));
    }

    #[tokio::test]
    async fn dependency_chain_activates_on_evaluate() {
        let store = test_store().await;
        let c = store
            .add(NewProjection {
                summary: "c".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let b = store
            .add(NewProjection {
                summary: "b".into(),
                depends_on: vec![NewDependency {
                    subject_id: c,
                    condition: "done".into(),
                    condition_type: None,
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        let a = store
            .add(NewProjection {
                summary: "a".into(),
                depends_on: vec![NewDependency {
                    subject_id: b,
                    condition: "done".into(),
                    condition_type: None,
                }],
                ..Default::default()
            })
            .await
            .unwrap();

        store.resolve(c, ProjectionStatus::Done).await.unwrap();
        let activations = store.evaluate_dependencies().await.unwrap();
        assert_eq!(activations, 1); // only b activates this pass; a still waits on b's resolved_when, not its status

        store.resolve(b, ProjectionStatus::Done).await.unwrap();
        let activations = store.evaluate_dependencies().await.unwrap();
        assert_eq!(activations, 1);
        assert!(store.get_dependencies(Some(a)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn check_triggers_keyword_phase() {
        let store = test_store().await;
        let id = store
            .add(NewProjection {
                summary: "follow up".into(),
                trigger_on_fact: Some("worker w-abc123 complete".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let activated = store
            .check_triggers("worker w-abc123 complete, results at /tmp/x", None, 0.55)
            .await
            .unwrap();
        assert_eq!(activated.len(), 1);
        assert_eq!(activated[0].id, id);
        assert!(activated[0].trigger_on_fact.is_none());

        // idempotent: a second matching fact does not re-activate.
        let activated_again = store
            .check_triggers("worker w-abc123 complete again", None, 0.55)
            .await
            .unwrap();
        assert!(activated_again.is_empty());
    }

    #[tokio::test]
    async fn reflection_meta_roundtrips_and_upserts() {
        let store = test_store().await;
        assert_eq!(store.get_meta("last_reflection_at").await.unwrap(), None);
        store.set_meta("last_reflection_at", "2026-01-01T00:00:00Z").await.unwrap();
        assert_eq!(
            store.get_meta("last_reflection_at").await.unwrap().as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
        store.set_meta("last_reflection_at", "2026-01-02T00:00:00Z").await.unwrap();
        assert_eq!(
            store.get_meta("last_reflection_at").await.unwrap().as_deref(),
            Some("2026-01-02T00:00:00Z")
        );
    }
}
