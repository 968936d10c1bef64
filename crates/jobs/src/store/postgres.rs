//! Postgres-backed job store implementation.
//!
//! Queue state lives in two tables (`jobs`, `dead_letter_entries`, see
//! `migrations/0001_jobs.sql`). Concurrency safety comes from the database:
//!
//! - **Claim** is one statement: a `FOR UPDATE SKIP LOCKED` candidate scan
//!   feeding an `UPDATE ... RETURNING`, so concurrent workers never lease the
//!   same row and never block on each other's candidates.
//! - **Completion/failure** writes are compare-and-swap on the lease token
//!   `(job_id, claimed_by_worker, claimed_at)` with `status = 'processing'`;
//!   zero updated rows means the lease was reclaimed.
//! - **Idempotency** is the partial unique index on
//!   `(tenant_id, idempotency_key) WHERE status <> 'cancelled'`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation on `jobs_tenant_idempotency_key_uq`) | `23505` | `DuplicateKeyRace` | Concurrent enqueue with the same key |
//! | Database (other) | Any other | `Storage` | Constraint or server errors |
//! | PoolClosed / Io / other | N/A | `Storage` | Connectivity failures |
//!
//! ## Thread Safety
//!
//! `PostgresJobStore` is `Send + Sync`; all operations go through the SQLx
//! connection pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row};
use tracing::instrument;
use uuid::Uuid;

use quotecash_core::{CorrelationId, TenantId, UserId};

use super::{
    ClaimRequest, Completion, JobFilter, JobStats, JobStore, JobStoreError, Review,
    ReviewTransition,
};
use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetterReason, ReprocessStatus};
use crate::types::{DeadLetterId, Job, JobFailure, JobId, JobStatus, Lease, WorkerId};

/// Schema applied by [`PostgresJobStore::ensure_schema`].
pub const MIGRATION: &str = include_str!("../../migrations/0001_jobs.sql");

const IDEMPOTENCY_INDEX: &str = "jobs_tenant_idempotency_key_uq";

const LEASE_PREDICATE: &str = "job_id = $1 AND tenant_id = $2 AND status = 'processing' \
     AND claimed_by_worker = $3 AND claimed_at = $4";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new PostgresJobStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a pool of at most `max_connections` to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE tenant_id = $1 AND idempotency_key = $2 AND status <> 'cancelled'
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(idempotency_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(
        skip(self, job),
        fields(tenant_id = %job.tenant_id, job_id = %job.job_id),
        err
    )]
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        insert_job(&mut conn, &job).await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = $1 AND tenant_id = $2")
            .bind(job_id.0)
            .bind(*tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(
        skip(self, request),
        fields(worker_id = %request.worker_id, batch_size = request.batch_size),
        err
    )]
    async fn claim(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let categories: Vec<String> = request
            .categories
            .iter()
            .map(|c| c.as_str().to_string())
            .collect();

        // Reclaimed leases keep their attempt_count; SET expressions see the
        // pre-update row.
        let rows = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT job_id
                FROM jobs
                WHERE (
                        (status = 'pending' AND scheduled_at <= $1)
                     OR (status = 'failed' AND next_retry_at <= $1)
                     OR (status = 'processing' AND claimed_at <= $2)
                      )
                  AND ($3::uuid IS NULL OR tenant_id = $3)
                  AND (cardinality($4::text[]) = 0 OR category = ANY($4))
                ORDER BY priority ASC, scheduled_at ASC, job_id ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = 'processing',
                claimed_at = $1,
                claimed_by_worker = $6,
                started_at = $1,
                next_retry_at = NULL,
                attempt_count = CASE
                    WHEN j.status = 'processing' THEN j.attempt_count
                    ELSE j.attempt_count + 1
                END,
                updated_at = $1
            FROM candidates c
            WHERE j.job_id = c.job_id
            RETURNING j.*
            "#,
        )
        .bind(now)
        .bind(lease_cutoff)
        .bind(request.tenant_id.map(Uuid::from))
        .bind(categories)
        .bind(i64::try_from(request.batch_size).unwrap_or(i64::MAX))
        .bind(request.worker_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|job| (job.priority, job.scheduled_at, job.job_id));
        Ok(jobs)
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job_id, worker_id = %lease.worker_id), err)]
    async fn renew_lease(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET claimed_at = $5, started_at = $5, updated_at = $5 \
             WHERE {LEASE_PREDICATE} RETURNING *"
        );
        let row = bind_lease(sqlx::query(&sql), lease)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("renew_lease", e))?
            .ok_or(JobStoreError::LeaseLost(lease.job_id))?;

        job_from_row(&row)
    }

    async fn complete(
        &self,
        lease: &Lease,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Completion, JobStoreError> {
        let mut tx = self.begin().await?;

        let sql = format!(
            "UPDATE jobs SET status = 'completed', completed_at = $5, result = $6, \
             claimed_at = NULL, claimed_by_worker = NULL, updated_at = $5 \
             WHERE {LEASE_PREDICATE} RETURNING *"
        );
        let row = bind_lease(sqlx::query(&sql), lease)
            .bind(now)
            .bind(result)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("complete_job", e))?
            .ok_or(JobStoreError::LeaseLost(lease.job_id))?;
        let job = job_from_row(&row)?;

        let resolved_entry = match job.reprocessed_from {
            Some(entry_id) => {
                let row = sqlx::query(
                    r#"
                    UPDATE dead_letter_entries
                    SET reprocess_status = 'resolved', updated_at = $4
                    WHERE entry_id = $1 AND tenant_id = $2
                      AND reprocess_status = 'reprocessing' AND new_job_id = $3
                    RETURNING *
                    "#,
                )
                .bind(entry_id.0)
                .bind(*job.tenant_id.as_uuid())
                .bind(job.job_id.0)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("resolve_dead_letter", e))?;
                row.as_ref().map(entry_from_row).transpose()?
            }
            None => None,
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(Completion {
            job,
            resolved_entry,
        })
    }

    #[instrument(skip(self, lease, failure), fields(job_id = %lease.job_id, error_class = %failure.error_class), err)]
    async fn fail(
        &self,
        lease: &Lease,
        failure: &JobFailure,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET status = 'failed', next_retry_at = $5, error_class = $6, \
             last_error = $7, claimed_at = NULL, claimed_by_worker = NULL, updated_at = $8 \
             WHERE {LEASE_PREDICATE} RETURNING *"
        );
        let row = bind_lease(sqlx::query(&sql), lease)
            .bind(next_retry_at)
            .bind(failure.error_class.as_str())
            .bind(failure.message.as_str())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fail_job", e))?
            .ok_or(JobStoreError::LeaseLost(lease.job_id))?;

        job_from_row(&row)
    }

    #[instrument(skip(self, lease, failure), fields(job_id = %lease.job_id, reason = %reason), err)]
    async fn dead_letter(
        &self,
        lease: &Lease,
        failure: &JobFailure,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) -> Result<(Job, DeadLetterEntry), JobStoreError> {
        let mut tx = self.begin().await?;

        let sql = format!(
            "UPDATE jobs SET status = 'dead_lettered', next_retry_at = NULL, completed_at = $5, \
             error_class = $6, last_error = $7, claimed_at = NULL, claimed_by_worker = NULL, \
             updated_at = $5 WHERE {LEASE_PREDICATE} RETURNING *"
        );
        let row = bind_lease(sqlx::query(&sql), lease)
            .bind(now)
            .bind(failure.error_class.as_str())
            .bind(failure.message.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("dead_letter_job", e))?
            .ok_or(JobStoreError::LeaseLost(lease.job_id))?;
        let job = job_from_row(&row)?;

        let existing = match job.reprocessed_from {
            Some(entry_id) => lock_entry(&mut tx, job.tenant_id, entry_id).await?,
            None => None,
        };
        let entry = match existing {
            Some(mut entry) => {
                entry.refresh(&job, failure, reason, now);
                update_entry(&mut tx, &entry).await?;
                entry
            }
            None => {
                let entry = DeadLetterEntry::from_job(DeadLetterId::new(), &job, failure, reason, now);
                insert_entry(&mut tx, &entry).await?;
                entry
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok((job, entry))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', next_retry_at = NULL, updated_at = $3
            WHERE job_id = $1 AND tenant_id = $2 AND status IN ('pending', 'failed')
            RETURNING *
            "#,
        )
        .bind(job_id.0)
        .bind(*tenant_id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => match self.get(tenant_id, job_id).await? {
                Some(job) => Err(JobStoreError::InvalidTransition(format!(
                    "cannot cancel job {job_id} in status {}",
                    job.status
                ))),
                None => Err(JobStoreError::NotFound(job_id)),
            },
        }
    }

    #[instrument(skip(self, filter), fields(tenant_id = %filter.tenant_id), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR category = $3)
            ORDER BY created_at ASC, job_id ASC
            LIMIT $4
            "#,
        )
        .bind(*filter.tenant_id.as_uuid())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.category.map(|c| c.as_str()))
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM jobs WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(*tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| decode_error("status", e))?;
            let total: i64 = row.try_get("total").map_err(|e| decode_error("total", e))?;
            stats.count(parse_enum(&status)?, usize::try_from(total).unwrap_or_default());
        }

        let pending_review: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM dead_letter_entries
            WHERE tenant_id = $1 AND reprocess_status = 'pending_review'
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_stats", e))?
        .try_get("total")
        .map_err(|e| decode_error("total", e))?;
        stats.dead_letters_pending_review = usize::try_from(pending_review).unwrap_or_default();

        Ok(stats)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn get_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM dead_letter_entries WHERE entry_id = $1 AND tenant_id = $2")
            .bind(entry_id.0)
            .bind(*tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_dead_letter", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }

    #[instrument(skip(self, filter), fields(tenant_id = %filter.tenant_id), err)]
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM dead_letter_entries
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR category = $2)
              AND ($3::text IS NULL OR error_class = $3)
              AND ($4::text IS NULL OR reprocess_status = $4)
            ORDER BY dead_lettered_at ASC, entry_id ASC
            LIMIT $5
            "#,
        )
        .bind(*filter.tenant_id.as_uuid())
        .bind(filter.category.map(|c| c.as_str()))
        .bind(filter.error_class.map(|c| c.as_str()))
        .bind(filter.reprocess_status.map(|s| s.as_str()))
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self, review), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn reprocess_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
        review: &Review,
    ) -> Result<(DeadLetterEntry, Job), JobStoreError> {
        let mut tx = self.begin().await?;

        let mut entry = lock_entry(&mut tx, tenant_id, entry_id)
            .await?
            .ok_or(JobStoreError::DeadLetterNotFound(entry_id))?;
        if entry.reprocess_status != ReprocessStatus::PendingReview {
            return Err(JobStoreError::InvalidTransition(format!(
                "cannot reprocess dead letter {entry_id} in status {}",
                entry.reprocess_status
            )));
        }

        // A producer may already own a derived key; move on to the next generation.
        let mut inserted = None;
        for generation in entry.next_generations() {
            let candidate = entry.reprocess_job(generation, review.at);
            if let Some(job) = try_insert_job(&mut tx, &candidate).await? {
                inserted = Some((generation, job));
                break;
            }
        }
        let Some((generation, job)) = inserted else {
            return Err(JobStoreError::InvalidTransition(format!(
                "no free reprocess key for dead letter {entry_id}"
            )));
        };
        entry.mark_reprocessing(&job, generation, review);
        update_entry(&mut tx, &entry).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok((entry, job))
    }

    #[instrument(skip(self, review), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn review_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
        transition: ReviewTransition,
        review: &Review,
    ) -> Result<DeadLetterEntry, JobStoreError> {
        let mut tx = self.begin().await?;

        let mut entry = lock_entry(&mut tx, tenant_id, entry_id)
            .await?
            .ok_or(JobStoreError::DeadLetterNotFound(entry_id))?;
        if !transition.allowed_from().contains(&entry.reprocess_status) {
            return Err(JobStoreError::InvalidTransition(format!(
                "cannot move dead letter {entry_id} from {} to {}",
                entry.reprocess_status,
                transition.target()
            )));
        }
        entry.reprocess_status = transition.target();
        entry.record_review(review);
        update_entry(&mut tx, &entry).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(entry)
    }
}

fn bind_lease<'q>(
    query: Query<'q, Postgres, PgArguments>,
    lease: &'q Lease,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(lease.job_id.0)
        .bind(*lease.tenant_id.as_uuid())
        .bind(lease.worker_id.as_str())
        .bind(lease.claimed_at)
}

const INSERT_JOB: &str = r#"
        INSERT INTO jobs (
            job_id, tenant_id, category, job_type, payload, payload_version,
            idempotency_key, correlation_id, status, priority, scheduled_at,
            claimed_at, claimed_by_worker, attempt_count, max_attempts,
            next_retry_at, error_class, last_error, result, reprocessed_from,
            created_at, updated_at, started_at, completed_at
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
            $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24
        )"#;

async fn insert_job(conn: &mut PgConnection, job: &Job) -> Result<Job, JobStoreError> {
    let sql = format!("{INSERT_JOB} RETURNING *");
    let row = bind_job(sqlx::query(&sql), job)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if is_idempotency_violation(&e) {
                JobStoreError::DuplicateKeyRace(job.idempotency_key.clone())
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

    job_from_row(&row)
}

/// Insert unless a live job already holds the idempotency key. A conflict
/// leaves the surrounding transaction usable.
async fn try_insert_job(conn: &mut PgConnection, job: &Job) -> Result<Option<Job>, JobStoreError> {
    let sql = format!(
        "{INSERT_JOB} ON CONFLICT (tenant_id, idempotency_key) \
         WHERE status <> 'cancelled' DO NOTHING RETURNING *"
    );
    let row = bind_job(sqlx::query(&sql), job)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

    row.as_ref().map(job_from_row).transpose()
}

fn bind_job<'q>(
    query: Query<'q, Postgres, PgArguments>,
    job: &'q Job,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(job.job_id.0)
        .bind(*job.tenant_id.as_uuid())
        .bind(job.category.as_str())
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(to_i32(job.payload_version))
        .bind(&job.idempotency_key)
        .bind(*job.correlation_id.as_uuid())
        .bind(job.status.as_str())
        .bind(i16::from(job.priority))
        .bind(job.scheduled_at)
        .bind(job.claimed_at)
        .bind(job.claimed_by_worker.as_ref().map(|w| w.as_str()))
        .bind(to_i32(job.attempt_count))
        .bind(to_i32(job.max_attempts))
        .bind(job.next_retry_at)
        .bind(job.error_class.map(|c| c.as_str()))
        .bind(job.last_error.as_deref())
        .bind(&job.result)
        .bind(job.reprocessed_from.map(|id| id.0))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
}

async fn lock_entry(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    entry_id: DeadLetterId,
) -> Result<Option<DeadLetterEntry>, JobStoreError> {
    let row = sqlx::query(
        "SELECT * FROM dead_letter_entries WHERE entry_id = $1 AND tenant_id = $2 FOR UPDATE",
    )
    .bind(entry_id.0)
    .bind(*tenant_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("lock_dead_letter", e))?;

    row.as_ref().map(entry_from_row).transpose()
}

async fn insert_entry(conn: &mut PgConnection, entry: &DeadLetterEntry) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        INSERT INTO dead_letter_entries (
            entry_id, original_job_id, tenant_id, category, job_type, payload,
            payload_version, idempotency_key, correlation_id, priority,
            attempt_count, max_attempts, error_class, last_error, reason,
            reprocess_status, new_job_id, reprocess_generation, reviewed_by,
            reviewed_at, review_note, job_created_at, dead_lettered_at, updated_at
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
            $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24
        )
        "#,
    )
    .bind(entry.entry_id.0)
    .bind(entry.original_job_id.0)
    .bind(*entry.tenant_id.as_uuid())
    .bind(entry.category.as_str())
    .bind(&entry.job_type)
    .bind(&entry.payload)
    .bind(to_i32(entry.payload_version))
    .bind(&entry.idempotency_key)
    .bind(*entry.correlation_id.as_uuid())
    .bind(i16::from(entry.priority))
    .bind(to_i32(entry.attempt_count))
    .bind(to_i32(entry.max_attempts))
    .bind(entry.error_class.as_str())
    .bind(&entry.last_error)
    .bind(entry.reason.as_str())
    .bind(entry.reprocess_status.as_str())
    .bind(entry.new_job_id.map(|id| id.0))
    .bind(to_i32(entry.reprocess_generation))
    .bind(entry.reviewed_by.map(Uuid::from))
    .bind(entry.reviewed_at)
    .bind(entry.review_note.as_deref())
    .bind(entry.job_created_at)
    .bind(entry.dead_lettered_at)
    .bind(entry.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;
    Ok(())
}

/// Persist every mutable column of an entry.
async fn update_entry(conn: &mut PgConnection, entry: &DeadLetterEntry) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE dead_letter_entries
        SET attempt_count = $3,
            error_class = $4,
            last_error = $5,
            reason = $6,
            reprocess_status = $7,
            new_job_id = $8,
            reprocess_generation = $9,
            reviewed_by = $10,
            reviewed_at = $11,
            review_note = $12,
            dead_lettered_at = $13,
            updated_at = $14
        WHERE entry_id = $1 AND tenant_id = $2
        "#,
    )
    .bind(entry.entry_id.0)
    .bind(*entry.tenant_id.as_uuid())
    .bind(to_i32(entry.attempt_count))
    .bind(entry.error_class.as_str())
    .bind(&entry.last_error)
    .bind(entry.reason.as_str())
    .bind(entry.reprocess_status.as_str())
    .bind(entry.new_job_id.map(|id| id.0))
    .bind(to_i32(entry.reprocess_generation))
    .bind(entry.reviewed_by.map(Uuid::from))
    .bind(entry.reviewed_at)
    .bind(entry.review_note.as_deref())
    .bind(entry.dead_lettered_at)
    .bind(entry.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_dead_letter", e))?;
    Ok(())
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_i32(column: &str, value: i32) -> Result<u32, JobStoreError> {
    u32::try_from(value)
        .map_err(|_| JobStoreError::Storage(format!("negative value in column {column}: {value}")))
}

fn parse_enum<T>(value: &str) -> Result<T, JobStoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| JobStoreError::Storage(format!("failed to decode row: {e}")))
}

fn decode_error(column: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode column {column}: {err}"))
}

fn is_idempotency_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505")
                && db_err.constraint() == Some(IDEMPOTENCY_INDEX)
        }
        _ => false,
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") if db_err.constraint() == Some(IDEMPOTENCY_INDEX) => {
                    JobStoreError::DuplicateKeyRace(msg)
                }
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("connection pool timed out in {}", operation))
        }
        other => JobStoreError::Storage(format!("error in {}: {}", operation, other)),
    }
}

/// Raw `jobs` row.
struct JobRow {
    job_id: Uuid,
    tenant_id: Uuid,
    category: String,
    job_type: String,
    payload: serde_json::Value,
    payload_version: i32,
    idempotency_key: String,
    correlation_id: Uuid,
    status: String,
    priority: i16,
    scheduled_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by_worker: Option<String>,
    attempt_count: i32,
    max_attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    error_class: Option<String>,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
    reprocessed_from: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            job_id: row.try_get("job_id")?,
            tenant_id: row.try_get("tenant_id")?,
            category: row.try_get("category")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            payload_version: row.try_get("payload_version")?,
            idempotency_key: row.try_get("idempotency_key")?,
            correlation_id: row.try_get("correlation_id")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            scheduled_at: row.try_get("scheduled_at")?,
            claimed_at: row.try_get("claimed_at")?,
            claimed_by_worker: row.try_get("claimed_by_worker")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            next_retry_at: row.try_get("next_retry_at")?,
            error_class: row.try_get("error_class")?,
            last_error: row.try_get("last_error")?,
            result: row.try_get("result")?,
            reprocessed_from: row.try_get("reprocessed_from")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            job_id: JobId::from_uuid(row.job_id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            category: parse_enum(&row.category)?,
            job_type: row.job_type,
            payload: row.payload,
            payload_version: from_i32("payload_version", row.payload_version)?,
            idempotency_key: row.idempotency_key,
            correlation_id: CorrelationId::from_uuid(row.correlation_id),
            status: parse_enum::<JobStatus>(&row.status)?,
            priority: u8::try_from(row.priority).map_err(|_| {
                JobStoreError::Storage(format!("priority out of range: {}", row.priority))
            })?,
            scheduled_at: row.scheduled_at,
            claimed_at: row.claimed_at,
            claimed_by_worker: row.claimed_by_worker.map(WorkerId::new),
            attempt_count: from_i32("attempt_count", row.attempt_count)?,
            max_attempts: from_i32("max_attempts", row.max_attempts)?,
            next_retry_at: row.next_retry_at,
            error_class: row.error_class.as_deref().map(parse_enum).transpose()?,
            last_error: row.last_error,
            result: row.result,
            reprocessed_from: row.reprocessed_from.map(DeadLetterId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

/// Raw `dead_letter_entries` row.
struct DeadLetterRow {
    entry_id: Uuid,
    original_job_id: Uuid,
    tenant_id: Uuid,
    category: String,
    job_type: String,
    payload: serde_json::Value,
    payload_version: i32,
    idempotency_key: String,
    correlation_id: Uuid,
    priority: i16,
    attempt_count: i32,
    max_attempts: i32,
    error_class: String,
    last_error: String,
    reason: String,
    reprocess_status: String,
    new_job_id: Option<Uuid>,
    reprocess_generation: i32,
    reviewed_by: Option<Uuid>,
    reviewed_at: Option<DateTime<Utc>>,
    review_note: Option<String>,
    job_created_at: DateTime<Utc>,
    dead_lettered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for DeadLetterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            entry_id: row.try_get("entry_id")?,
            original_job_id: row.try_get("original_job_id")?,
            tenant_id: row.try_get("tenant_id")?,
            category: row.try_get("category")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            payload_version: row.try_get("payload_version")?,
            idempotency_key: row.try_get("idempotency_key")?,
            correlation_id: row.try_get("correlation_id")?,
            priority: row.try_get("priority")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            error_class: row.try_get("error_class")?,
            last_error: row.try_get("last_error")?,
            reason: row.try_get("reason")?,
            reprocess_status: row.try_get("reprocess_status")?,
            new_job_id: row.try_get("new_job_id")?,
            reprocess_generation: row.try_get("reprocess_generation")?,
            reviewed_by: row.try_get("reviewed_by")?,
            reviewed_at: row.try_get("reviewed_at")?,
            review_note: row.try_get("review_note")?,
            job_created_at: row.try_get("job_created_at")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<DeadLetterRow> for DeadLetterEntry {
    type Error = JobStoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(DeadLetterEntry {
            entry_id: DeadLetterId::from_uuid(row.entry_id),
            original_job_id: JobId::from_uuid(row.original_job_id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            category: parse_enum(&row.category)?,
            job_type: row.job_type,
            payload: row.payload,
            payload_version: from_i32("payload_version", row.payload_version)?,
            idempotency_key: row.idempotency_key,
            correlation_id: CorrelationId::from_uuid(row.correlation_id),
            priority: u8::try_from(row.priority).map_err(|_| {
                JobStoreError::Storage(format!("priority out of range: {}", row.priority))
            })?,
            attempt_count: from_i32("attempt_count", row.attempt_count)?,
            max_attempts: from_i32("max_attempts", row.max_attempts)?,
            error_class: parse_enum(&row.error_class)?,
            last_error: row.last_error,
            reason: parse_enum(&row.reason)?,
            reprocess_status: parse_enum(&row.reprocess_status)?,
            new_job_id: row.new_job_id.map(JobId::from_uuid),
            reprocess_generation: from_i32("reprocess_generation", row.reprocess_generation)?,
            reviewed_by: row.reviewed_by.map(UserId::from_uuid),
            reviewed_at: row.reviewed_at,
            review_note: row.review_note,
            job_created_at: row.job_created_at,
            dead_lettered_at: row.dead_lettered_at,
            updated_at: row.updated_at,
        })
    }
}

fn entry_from_row(row: &PgRow) -> Result<DeadLetterEntry, JobStoreError> {
    DeadLetterRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize dead-letter row: {e}")))?
        .try_into()
}
