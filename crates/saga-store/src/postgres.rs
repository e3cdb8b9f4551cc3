use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Page, PageRequest, Payload, Result, SagaFilter, SagaId, SagaRecord, StepRecord, StoreError,
    Version,
    store::{SagaStore, validate_insert, validate_update},
};

const SAGA_COLUMNS: &str = "id, saga_type, definition_version, status, payload, version, \
     failure_reason, deadline_at, created_at, updated_at";

const STEP_COLUMNS: &str = "saga_id, step_name, step_index, status, captured_output, \
     attempt_count, compensation_attempt_count, generation, failure_reason, executed_at, updated_at";

/// PostgreSQL-backed saga store implementation.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn payload_from_json(value: serde_json::Value, column: &str) -> Result<Payload> {
        match value {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(StoreError::Corrupt(format!(
                "{column} must be a JSON object, found {other}"
            ))),
        }
    }

    fn row_to_saga(row: PgRow) -> Result<SagaRecord> {
        let status: String = row.try_get("status")?;
        let definition_version: i32 = row.try_get("definition_version")?;

        Ok(SagaRecord {
            id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_type: row.try_get("saga_type")?,
            definition_version: definition_version as u32,
            status: status.parse()?,
            payload: Self::payload_from_json(row.try_get("payload")?, "payload")?,
            failure_reason: row.try_get("failure_reason")?,
            version: Version::new(row.try_get("version")?),
            deadline_at: row.try_get("deadline_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_step(row: PgRow) -> Result<StepRecord> {
        let status: String = row.try_get("status")?;
        let captured_output: Option<serde_json::Value> = row.try_get("captured_output")?;

        Ok(StepRecord {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            step_name: row.try_get("step_name")?,
            step_index: row.try_get::<i32, _>("step_index")? as u32,
            status: status.parse()?,
            captured_output: captured_output
                .map(|value| Self::payload_from_json(value, "captured_output"))
                .transpose()?,
            attempt_count: row.try_get::<i32, _>("attempt_count")? as u32,
            compensation_attempt_count: row.try_get::<i32, _>("compensation_attempt_count")?
                as u32,
            generation: row.try_get::<i32, _>("generation")? as u32,
            failure_reason: row.try_get("failure_reason")?,
            executed_at: row.try_get("executed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn filter_clause(filter: &SagaFilter) -> String {
        let mut sql = String::from(" WHERE 1=1");
        let mut param_count = 0;

        if filter.saga_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_type = ${param_count}"));
        }
        if filter.status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ${param_count}"));
        }
        if filter.created_from.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at >= ${param_count}"));
        }
        if filter.created_to.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at <= ${param_count}"));
        }
        sql
    }

    fn filter_param_count(filter: &SagaFilter) -> usize {
        [
            filter.saga_type.is_some(),
            filter.status.is_some(),
            filter.created_from.is_some(),
            filter.created_to.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn insert(&self, saga: &SagaRecord) -> Result<()> {
        validate_insert(saga)?;

        sqlx::query(
            r#"
            INSERT INTO saga_instances (id, saga_type, definition_version, status, payload, version, failure_reason, deadline_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(&saga.saga_type)
        .bind(saga.definition_version as i32)
        .bind(saga.status.as_str())
        .bind(serde_json::Value::Object(saga.payload.clone()))
        .bind(saga.version.as_i64())
        .bind(saga.failure_reason.as_deref())
        .bind(saga.deadline_at)
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::DuplicateSaga(saga.id);
            }
            StoreError::Database(e)
        })?;

        Ok(())
    }

    async fn update(&self, saga: &SagaRecord, step: Option<&StepRecord>) -> Result<Version> {
        validate_update(saga, step)?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Compare-and-set on the version; a concurrent writer blocks on the
        // row lock and then sees the bumped version.
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE saga_instances
            SET status = $3, payload = $4, failure_reason = $5, deadline_at = $6,
                version = version + 1, updated_at = $7
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(saga.version.as_i64())
        .bind(saga.status.as_str())
        .bind(serde_json::Value::Object(saga.payload.clone()))
        .bind(saga.failure_reason.as_deref())
        .bind(saga.deadline_at)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let new_version = match updated {
            Some(version) => Version::new(version),
            None => {
                let actual: Option<i64> =
                    sqlx::query_scalar("SELECT version FROM saga_instances WHERE id = $1")
                        .bind(saga.id.as_uuid())
                        .fetch_optional(&mut *tx)
                        .await?;

                return Err(match actual {
                    Some(actual) => StoreError::ConcurrencyConflict {
                        saga_id: saga.id,
                        expected: saga.version,
                        actual: Version::new(actual),
                    },
                    None => StoreError::SagaNotFound(saga.id),
                });
            }
        };

        if let Some(step) = step {
            sqlx::query(
                r#"
                INSERT INTO saga_step_records (saga_id, step_name, step_index, status, captured_output, attempt_count, compensation_attempt_count, generation, failure_reason, executed_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (saga_id, step_name) DO UPDATE SET
                    status = EXCLUDED.status,
                    captured_output = EXCLUDED.captured_output,
                    attempt_count = EXCLUDED.attempt_count,
                    compensation_attempt_count = EXCLUDED.compensation_attempt_count,
                    generation = EXCLUDED.generation,
                    failure_reason = EXCLUDED.failure_reason,
                    executed_at = EXCLUDED.executed_at,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(step.saga_id.as_uuid())
            .bind(&step.step_name)
            .bind(step.step_index as i32)
            .bind(step.status.as_str())
            .bind(
                step.captured_output
                    .clone()
                    .map(serde_json::Value::Object),
            )
            .bind(step.attempt_count as i32)
            .bind(step.compensation_attempt_count as i32)
            .bind(step.generation as i32)
            .bind(step.failure_reason.as_deref())
            .bind(step.executed_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(new_version)
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_instances WHERE id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn get_steps(&self, saga_id: SagaId) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM saga_step_records WHERE saga_id = $1 ORDER BY step_index ASC"
        ))
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_step).collect()
    }

    async fn list(&self, filter: &SagaFilter, page: PageRequest) -> Result<Page<SagaRecord>> {
        let where_clause = Self::filter_clause(filter);
        let next_param = Self::filter_param_count(filter) + 1;

        let count_sql = format!("SELECT COUNT(*) FROM saga_instances{where_clause}");
        let list_sql = format!(
            "SELECT {SAGA_COLUMNS} FROM saga_instances{where_clause} \
             ORDER BY created_at ASC, id ASC LIMIT ${} OFFSET ${}",
            next_param,
            next_param + 1
        );

        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        let mut list_query = sqlx::query(&list_sql);

        if let Some(ref saga_type) = filter.saga_type {
            count_query = count_query.bind(saga_type.clone());
            list_query = list_query.bind(saga_type.clone());
        }
        if let Some(status) = filter.status {
            count_query = count_query.bind(status.as_str());
            list_query = list_query.bind(status.as_str());
        }
        if let Some(from) = filter.created_from {
            count_query = count_query.bind(from);
            list_query = list_query.bind(from);
        }
        if let Some(to) = filter.created_to {
            count_query = count_query.bind(to);
            list_query = list_query.bind(to);
        }

        let total = count_query.fetch_one(&self.pool).await?;
        let rows = list_query
            .bind(page.limit as i64)
            .bind(page.offset as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(Self::row_to_saga)
                .collect::<Result<_>>()?,
            total: total as u64,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn list_resumable(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaId>> {
        let ids: Vec<SagaId> = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM saga_instances
            WHERE status IN ('Created', 'Running', 'Compensating') AND updated_at <= $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(stale_before)
        .bind(limit as i64)
        .fetch(&self.pool)
        .map_ok(SagaId::from_uuid)
        .try_collect()
        .await?;

        Ok(ids)
    }
}
