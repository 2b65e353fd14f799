//! Result Store
//!
//! Append-only, idempotent persistence of observations in an embedded SQLite
//! database, keyed by (target_name, record_id). The pool is capped at a
//! single connection, which doubles as the serialization point for writes
//! coming from every worker of every target: no two workers can produce
//! divergent rows for the same key.

use crate::classify::{Classification, ErrorKind, GroundTruth};
use crate::config::RunMode;
use crate::corpus::CorpusKind;
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use std::collections::HashSet;
use std::str::FromStr;

/// Health check outcome for one target. Anything other than `Healthy`
/// excludes the target from dispatch for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unchecked,
    Healthy,
    Unreachable,
    NotInPreventionMode,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unchecked => "unchecked",
            Self::Healthy => "healthy",
            Self::Unreachable => "unreachable",
            Self::NotInPreventionMode => "not_in_prevention_mode",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unchecked" => Some(Self::Unchecked),
            "healthy" => Some(Self::Healthy),
            "unreachable" => Some(Self::Unreachable),
            "not_in_prevention_mode" => Some(Self::NotInPreventionMode),
            _ => None,
        }
    }

    /// Human-readable skip reason for the run summary.
    pub fn skip_reason(&self) -> &'static str {
        match self {
            Self::Unchecked => "health check never ran",
            Self::Healthy => "healthy",
            Self::Unreachable => "unreachable (connection failed or timed out)",
            Self::NotInPreventionMode => "canary request was not blocked (detection-only mode?)",
        }
    }
}

/// One WAF under test.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub base_url: String,
    pub health_state: HealthState,
}

impl Target {
    pub fn new(name: String, base_url: String) -> Self {
        Self { name, base_url, health_state: HealthState::Unchecked }
    }
}

/// One request outcome. Written once; a resumed run only fills gaps.
#[derive(Debug, Clone)]
pub struct Observation {
    pub target_name: String,
    pub record_id: String,
    pub corpus: CorpusKind,
    pub ground_truth: GroundTruth,
    pub http_status: Option<u16>,
    pub error_kind: Option<ErrorKind>,
    pub classification: Classification,
    pub test_name: String,
    pub observed_at: DateTime<Utc>,
}

/// Run configuration persisted alongside the results so a resumed run reuses
/// the settings the stored observations were produced with.
#[derive(Debug, Clone, FromRow)]
pub struct StoredRunConfig {
    pub max_workers: i64,
    pub fast_mode: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-target confusion-matrix counts, aggregated in SQL.
#[derive(Debug, Clone, Copy, Default, FromRow)]
pub struct ClassificationCounts {
    pub tp: i64,
    pub fp: i64,
    pub tn: i64,
    /// False negatives; `fn` is a keyword.
    pub fne: i64,
    pub errors: i64,
}

impl ClassificationCounts {
    pub fn total(&self) -> i64 {
        self.tp + self.fp + self.tn + self.fne + self.errors
    }
}

#[derive(Debug, FromRow)]
struct ObservationRow {
    target_name: String,
    record_id: String,
    corpus: String,
    ground_truth: String,
    http_status: Option<i64>,
    error_kind: Option<String>,
    classification: String,
    test_name: String,
    observed_at: DateTime<Utc>,
}

impl ObservationRow {
    fn decode(self) -> EngineResult<Observation> {
        let decode_err = |what: &str, value: &str| {
            EngineError::Store(sqlx::Error::Decode(
                format!("unknown {what} value {value:?} in observations table").into(),
            ))
        };
        Ok(Observation {
            corpus: CorpusKind::parse(&self.corpus)
                .ok_or_else(|| decode_err("corpus", &self.corpus))?,
            ground_truth: GroundTruth::parse(&self.ground_truth)
                .ok_or_else(|| decode_err("ground_truth", &self.ground_truth))?,
            error_kind: self
                .error_kind
                .as_deref()
                .map(|s| ErrorKind::parse(s).ok_or_else(|| decode_err("error_kind", s)))
                .transpose()?,
            classification: Classification::parse(&self.classification)
                .ok_or_else(|| decode_err("classification", &self.classification))?,
            http_status: self.http_status.map(|s| s as u16),
            target_name: self.target_name,
            record_id: self.record_id,
            test_name: self.test_name,
            observed_at: self.observed_at,
        })
    }
}

/// Database schema SQL
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS targets (
    name         TEXT PRIMARY KEY,
    base_url     TEXT NOT NULL,
    health_state TEXT NOT NULL DEFAULT 'unchecked'
);

CREATE TABLE IF NOT EXISTS observations (
    target_name    TEXT NOT NULL,
    record_id      TEXT NOT NULL,
    corpus         TEXT NOT NULL,
    ground_truth   TEXT NOT NULL,
    http_status    INTEGER,
    error_kind     TEXT,
    classification TEXT NOT NULL,
    test_name      TEXT NOT NULL,
    observed_at    TEXT NOT NULL,
    PRIMARY KEY (target_name, record_id)
);

CREATE INDEX IF NOT EXISTS idx_observations_target ON observations(target_name);
CREATE INDEX IF NOT EXISTS idx_observations_corpus ON observations(target_name, corpus);

CREATE TABLE IF NOT EXISTS run_config (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    max_workers INTEGER NOT NULL,
    fast_mode   INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);
"#;

/// Handle to the results database. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct ResultStore {
    pool: SqlitePool,
}

impl ResultStore {
    /// Open (creating if missing) the results database and apply the schema.
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let options =
            SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // One connection: SQLite has a single writer anyway, and funneling
        // every worker through one connection makes upserts atomic without
        // busy-retry handling.
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        tracing::debug!(url = database_url, "results store ready");

        Ok(Self { pool })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub async fn connect_in_memory() -> EngineResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Idempotent write of one observation. In resume mode an existing row
    /// wins (the observation was already made); in fresh mode the new row
    /// replaces it.
    pub async fn upsert(&self, obs: &Observation, mode: RunMode) -> EngineResult<()> {
        let sql = match mode {
            RunMode::Resume => {
                r#"
                INSERT INTO observations
                    (target_name, record_id, corpus, ground_truth, http_status,
                     error_kind, classification, test_name, observed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (target_name, record_id) DO NOTHING
                "#
            }
            RunMode::Fresh => {
                r#"
                INSERT INTO observations
                    (target_name, record_id, corpus, ground_truth, http_status,
                     error_kind, classification, test_name, observed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (target_name, record_id) DO UPDATE SET
                    corpus = excluded.corpus,
                    ground_truth = excluded.ground_truth,
                    http_status = excluded.http_status,
                    error_kind = excluded.error_kind,
                    classification = excluded.classification,
                    test_name = excluded.test_name,
                    observed_at = excluded.observed_at
                "#
            }
        };

        sqlx::query(sql)
            .bind(&obs.target_name)
            .bind(&obs.record_id)
            .bind(obs.corpus.as_str())
            .bind(obs.ground_truth.as_str())
            .bind(obs.http_status.map(|s| s as i64))
            .bind(obs.error_kind.map(|k| k.as_str()))
            .bind(obs.classification.as_str())
            .bind(&obs.test_name)
            .bind(obs.observed_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// True if an observation exists for (target, record).
    pub async fn exists(&self, target_name: &str, record_id: &str) -> EngineResult<bool> {
        let found: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM observations WHERE target_name = ? AND record_id = ?)",
        )
        .bind(target_name)
        .bind(record_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found != 0)
    }

    /// All record ids already attempted for a target. Feeds the dispatch
    /// pre-filter; error rows count as attempted, not as pending.
    pub async fn existing_record_ids(&self, target_name: &str) -> EngineResult<HashSet<String>> {
        let rows = sqlx::query("SELECT record_id FROM observations WHERE target_name = ?")
            .bind(target_name)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get::<String, _>(0)).collect())
    }

    /// All observations for a target, feeding the scoring aggregator.
    pub async fn query(&self, target_name: &str) -> EngineResult<Vec<Observation>> {
        let rows: Vec<ObservationRow> = sqlx::query_as(
            "SELECT * FROM observations WHERE target_name = ? ORDER BY record_id",
        )
        .bind(target_name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ObservationRow::decode).collect()
    }

    /// Aggregate confusion-matrix counts for a target in one query.
    pub async fn classification_counts(
        &self,
        target_name: &str,
    ) -> EngineResult<ClassificationCounts> {
        let counts: ClassificationCounts = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN classification = 'true_positive'  THEN 1 ELSE 0 END), 0) AS tp,
                COALESCE(SUM(CASE WHEN classification = 'false_positive' THEN 1 ELSE 0 END), 0) AS fp,
                COALESCE(SUM(CASE WHEN classification = 'true_negative'  THEN 1 ELSE 0 END), 0) AS tn,
                COALESCE(SUM(CASE WHEN classification = 'false_negative' THEN 1 ELSE 0 END), 0) AS fne,
                COALESCE(SUM(CASE WHEN classification = 'error'          THEN 1 ELSE 0 END), 0) AS errors
            FROM observations
            WHERE target_name = ?
            "#,
        )
        .bind(target_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(counts)
    }

    /// Wipe observations, targets and stored run configuration (fresh run).
    pub async fn reset(&self) -> EngineResult<()> {
        sqlx::query("DELETE FROM observations").execute(&self.pool).await?;
        sqlx::query("DELETE FROM targets").execute(&self.pool).await?;
        sqlx::query("DELETE FROM run_config").execute(&self.pool).await?;
        tracing::info!("starting new test, previous results were dropped");
        Ok(())
    }

    /// Drop one target's observations and health row, leaving the rest of the
    /// store untouched. Used when a single target is re-derived from fresh
    /// configuration.
    pub async fn reset_target(&self, target_name: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM observations WHERE target_name = ?")
            .bind(target_name)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM targets WHERE name = ?")
            .bind(target_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the resolved target set.
    pub async fn save_targets(&self, targets: &[Target]) -> EngineResult<()> {
        for target in targets {
            sqlx::query(
                r#"
                INSERT INTO targets (name, base_url, health_state)
                VALUES (?, ?, ?)
                ON CONFLICT (name) DO UPDATE SET
                    base_url = excluded.base_url,
                    health_state = excluded.health_state
                "#,
            )
            .bind(&target.name)
            .bind(&target.base_url)
            .bind(target.health_state.as_str())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn update_health(&self, name: &str, state: HealthState) -> EngineResult<()> {
        sqlx::query("UPDATE targets SET health_state = ? WHERE name = ?")
            .bind(state.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_targets(&self) -> EngineResult<Vec<Target>> {
        let rows = sqlx::query("SELECT name, base_url, health_state FROM targets ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let state: String = row.get("health_state");
                Ok(Target {
                    name: row.get("name"),
                    base_url: row.get("base_url"),
                    health_state: HealthState::parse(&state).ok_or_else(|| {
                        EngineError::Store(sqlx::Error::Decode(
                            format!("unknown health_state value {state:?}").into(),
                        ))
                    })?,
                })
            })
            .collect()
    }

    pub async fn save_run_config(&self, max_workers: usize, fast_mode: bool) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO run_config (id, max_workers, fast_mode, created_at)
            VALUES (1, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                max_workers = excluded.max_workers,
                fast_mode = excluded.fast_mode,
                created_at = excluded.created_at
            "#,
        )
        .bind(max_workers as i64)
        .bind(fast_mode)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_run_config(&self) -> EngineResult<Option<StoredRunConfig>> {
        let config: Option<StoredRunConfig> = sqlx::query_as(
            "SELECT max_workers, fast_mode, created_at FROM run_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(config)
    }

    /// Prior state exists when both a stored run configuration and at least
    /// one target survive from an earlier invocation.
    pub async fn has_prior_state(&self) -> EngineResult<bool> {
        let targets: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM targets").fetch_one(&self.pool).await?;
        Ok(self.load_run_config().await?.is_some() && targets > 0)
    }
}
