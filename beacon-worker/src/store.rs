use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;

use beacon_common::report::PositionReport;

/// Enumeration of errors for loads into the history table, split by what
/// the worker should do about them.
#[derive(Error, Debug)]
pub enum LoadError {
    /// Storage was unreachable or momentarily failing; the same insert
    /// can succeed if retried.
    #[error("storage temporarily unavailable: {error}")]
    Transient { error: sqlx::Error },
    /// The data itself was rejected (integrity or data errors); retrying
    /// the identical record will keep failing.
    #[error("record rejected by storage: {error}")]
    Failed { error: sqlx::Error },
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
}

impl LoadError {
    fn from_query_error(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db_error) => match db_error.code().as_deref() {
                // Class 22 (data exception) and 23 (integrity violation)
                // are properties of the record, not of the moment.
                Some(code) if code.starts_with("22") || code.starts_with("23") => {
                    LoadError::Failed { error }
                }
                _ => LoadError::Transient { error },
            },
            _ => LoadError::Transient { error },
        }
    }
}

/// The durable sink of the pipeline: a history table partitioned by
/// observation time, with a DEFAULT partition absorbing timestamps that
/// fall outside the materialized windows.
#[async_trait]
pub trait HistoryStore {
    /// Set-oriented insert of the whole batch as one atomic statement:
    /// either every report becomes a row or none does. This is the
    /// throughput-critical path and the reason batching exists.
    async fn insert_batch(&self, reports: &[PositionReport]) -> Result<u64, LoadError>;

    /// Isolated single-record insert, the degraded path used to fence off
    /// a failing record from the rest of its batch.
    async fn insert_one(&self, report: &PositionReport) -> Result<(), LoadError>;
}

pub struct PostgresHistoryStore {
    pool: PgPool,
}

impl PostgresHistoryStore {
    /// Initialize a store by lazily connecting a pool to the database in `url`.
    pub fn new(
        url: &str,
        max_connections: u32,
        app_name: &'static str,
    ) -> Result<Self, LoadError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| LoadError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    /// Initialize a store from a provided connection pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    async fn insert_batch(&self, reports: &[PositionReport]) -> Result<u64, LoadError> {
        if reports.is_empty() {
            return Ok(0);
        }

        let mut courier_ids: Vec<i64> = Vec::with_capacity(reports.len());
        let mut latitudes: Vec<f64> = Vec::with_capacity(reports.len());
        let mut longitudes: Vec<f64> = Vec::with_capacity(reports.len());
        let mut statuses: Vec<Option<String>> = Vec::with_capacity(reports.len());
        let mut recorded_ats: Vec<DateTime<Utc>> = Vec::with_capacity(reports.len());
        for report in reports {
            courier_ids.push(report.courier_id);
            latitudes.push(report.latitude);
            longitudes.push(report.longitude);
            statuses.push(report.status.clone());
            recorded_ats.push(report.recorded_at);
        }

        let result = sqlx::query(
            r#"
INSERT INTO position_history (courier_id, latitude, longitude, status, recorded_at)
    (SELECT * FROM UNNEST(
        $1::bigint[],
        $2::float8[],
        $3::float8[],
        $4::text[],
        $5::timestamptz[]))
            "#,
        )
        .bind(&courier_ids)
        .bind(&latitudes)
        .bind(&longitudes)
        .bind(&statuses)
        .bind(&recorded_ats)
        .execute(&self.pool)
        .await
        .map_err(LoadError::from_query_error)?;

        Ok(result.rows_affected())
    }

    async fn insert_one(&self, report: &PositionReport) -> Result<(), LoadError> {
        sqlx::query(
            r#"
INSERT INTO position_history (courier_id, latitude, longitude, status, recorded_at)
VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(report.courier_id)
        .bind(report.latitude)
        .bind(report.longitude)
        .bind(&report.status)
        .bind(report.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(LoadError::from_query_error)?;

        Ok(())
    }
}
