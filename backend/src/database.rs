use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One row per handled request.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub user_id: i64,
    pub api_id: i32,
    pub api_key_id: Option<i64>,
    pub endpoint: String,
    pub status_code: i32,
    pub response_time: f64,
    pub request_size: i64,
    pub response_size: i64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Typed analytics extracted from request/response payloads. Coordinates are
/// double precision end to end; rounding happens only at presentation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalyticsRecord {
    pub usage_id: i64,
    pub user_id: i64,
    pub api_id: i32,
    pub timestamp: Option<DateTime<Utc>>,
    pub polyline: Option<String>,
    pub start_latitude: Option<f64>,
    pub start_longitude: Option<f64>,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
    pub distance_meters: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub waypoints_count: Option<i32>,
    pub route_type: Option<String>,
    pub address: Option<String>,
    pub formatted_address: Option<String>,
    pub place_id: Option<String>,
    pub location_type: Option<String>,
    pub raw_request: Option<String>,
}

/// Persistence port for the usage tracker. The relational schema lives
/// behind this seam; handlers never see SQL.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Persists a usage row and returns its id.
    async fn record_usage(&self, record: &UsageRecord) -> Result<i64, SinkError>;
    async fn record_analytics(&self, record: &AnalyticsRecord) -> Result<(), SinkError>;
}

/// Postgres-backed sink.
pub struct PgUsageSink {
    pool: PgPool,
}

impl PgUsageSink {
    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        tracing::info!("PostgreSQL connection pool created");
        Ok(Self { pool })
    }

    /// Executes the schema migration. SQLx query() cannot handle multiple
    /// statements, so the file runs over a raw connection.
    pub async fn migrate(&self) -> Result<(), SinkError> {
        let mut conn = self.pool.acquire().await?;
        let migration_sql = include_str!("../migrations/20250601_create_usage.sql");
        sqlx::raw_sql(migration_sql).execute(&mut *conn).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl UsageSink for PgUsageSink {
    async fn record_usage(&self, record: &UsageRecord) -> Result<i64, SinkError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO api_usage (
                user_id, api_id, api_key_id, endpoint, status_code,
                response_time, request_size, response_size, ip_address,
                user_agent, timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(record.user_id)
        .bind(record.api_id)
        .bind(record.api_key_id)
        .bind(&record.endpoint)
        .bind(record.status_code)
        .bind(record.response_time)
        .bind(record.request_size)
        .bind(record.response_size)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(record.timestamp)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn record_analytics(&self, record: &AnalyticsRecord) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO api_analytics (
                usage_id, user_id, api_id, timestamp, polyline,
                start_latitude, start_longitude, end_latitude, end_longitude,
                distance_meters, duration_seconds, waypoints_count, route_type,
                address, formatted_address, place_id, location_type, raw_request
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18)
            "#,
        )
        .bind(record.usage_id)
        .bind(record.user_id)
        .bind(record.api_id)
        .bind(record.timestamp.unwrap_or_else(Utc::now))
        .bind(&record.polyline)
        .bind(record.start_latitude)
        .bind(record.start_longitude)
        .bind(record.end_latitude)
        .bind(record.end_longitude)
        .bind(record.distance_meters)
        .bind(record.duration_seconds)
        .bind(record.waypoints_count)
        .bind(&record.route_type)
        .bind(&record.address)
        .bind(&record.formatted_address)
        .bind(&record.place_id)
        .bind(&record.location_type)
        .bind(&record.raw_request)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory sink for tests; records are inspectable after the fact.
#[derive(Default)]
pub struct MemorySink {
    usage: std::sync::Mutex<Vec<UsageRecord>>,
    analytics: std::sync::Mutex<Vec<AnalyticsRecord>>,
}

impl MemorySink {
    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.lock().expect("usage lock").clone()
    }

    pub fn analytics_records(&self) -> Vec<AnalyticsRecord> {
        self.analytics.lock().expect("analytics lock").clone()
    }
}

#[async_trait]
impl UsageSink for MemorySink {
    async fn record_usage(&self, record: &UsageRecord) -> Result<i64, SinkError> {
        let mut usage = self.usage.lock().expect("usage lock");
        usage.push(record.clone());
        Ok(usage.len() as i64)
    }

    async fn record_analytics(&self, record: &AnalyticsRecord) -> Result<(), SinkError> {
        self.analytics
            .lock()
            .expect("analytics lock")
            .push(record.clone());
        Ok(())
    }
}
