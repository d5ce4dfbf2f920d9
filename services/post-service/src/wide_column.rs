use crate::config::DatabaseConfig;
use crate::model::{Location, Post, PostId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row as _;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub const FAMILY_POST: &str = "post";
pub const FAMILY_LOCATION: &str = "location";
pub const COLUMN_USER: &str = "user";
pub const COLUMN_MESSAGE: &str = "message";
pub const COLUMN_LAT: &str = "lat";
pub const COLUMN_LON: &str = "lon";

/// Errors reported by the wide-column store
#[derive(Error, Debug)]
pub enum WideColumnError {
    #[error("Wide-column store error: {0}")]
    Database(String),

    #[error("Row {row_key} is malformed: {reason}")]
    MalformedRow { row_key: String, reason: String },
}

impl From<sqlx::Error> for WideColumnError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Cells addressed by `(family, column)`, applied to one row as a unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowMutation {
    cells: BTreeMap<(String, String), Vec<u8>>,
}

impl RowMutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, family: &str, column: &str, value: impl Into<Vec<u8>>) -> &mut Self {
        self.cells
            .insert((family.to_string(), column.to_string()), value.into());
        self
    }

    pub fn get(&self, family: &str, column: &str) -> Option<&[u8]> {
        self.cells
            .get(&(family.to_string(), column.to_string()))
            .map(Vec::as_slice)
    }

    pub fn cells(&self) -> impl Iterator<Item = (&str, &str, &[u8])> {
        self.cells
            .iter()
            .map(|((family, column), value)| (family.as_str(), column.as_str(), value.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl From<&Post> for RowMutation {
    /// Coordinates are stored as shortest round-trip decimal text
    fn from(post: &Post) -> Self {
        let mut mutation = RowMutation::new();
        mutation
            .set(FAMILY_POST, COLUMN_USER, post.user.as_bytes())
            .set(FAMILY_POST, COLUMN_MESSAGE, post.message.as_bytes())
            .set(FAMILY_LOCATION, COLUMN_LAT, post.location.lat.to_string())
            .set(FAMILY_LOCATION, COLUMN_LON, post.location.lon.to_string());
        mutation
    }
}

/// Latest value of every column of one row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: String,
    pub cells: RowMutation,
}

impl Row {
    fn text(&self, family: &str, column: &str) -> Result<String, WideColumnError> {
        let raw = self
            .cells
            .get(family, column)
            .ok_or_else(|| self.malformed(format!("missing {}:{}", family, column)))?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| self.malformed(format!("{}:{} is not UTF-8", family, column)))
    }

    fn coordinate(&self, column: &str) -> Result<f64, WideColumnError> {
        let text = self.text(FAMILY_LOCATION, column)?;
        text.parse()
            .map_err(|_| self.malformed(format!("location:{} is not a number: {}", column, text)))
    }

    fn malformed(&self, reason: String) -> WideColumnError {
        WideColumnError::MalformedRow {
            row_key: self.key.clone(),
            reason,
        }
    }

    /// Rebuild the post stored in this row; the row does not carry the media URL
    pub fn to_post(&self) -> Result<Post, WideColumnError> {
        let id: PostId = self
            .key
            .parse()
            .map_err(|_| self.malformed("row key is not a post id".to_string()))?;

        Ok(Post::new(
            id,
            self.text(FAMILY_POST, COLUMN_USER)?,
            self.text(FAMILY_POST, COLUMN_MESSAGE)?,
            Location::new(self.coordinate(COLUMN_LAT)?, self.coordinate(COLUMN_LON)?),
        ))
    }
}

/// Wide-column store holding the structured fields of each post
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WideColumnStore: Send + Sync {
    /// Apply every cell of `mutation` to `row_key` atomically at `timestamp`
    /// (microseconds since the Unix epoch)
    async fn write_fields(
        &self,
        row_key: &str,
        mutation: &RowMutation,
        timestamp: i64,
    ) -> Result<(), WideColumnError>;

    /// Latest value of each column, or `None` if the row has no cells
    async fn read_row(&self, row_key: &str) -> Result<Option<Row>, WideColumnError>;

    async fn health_check(&self) -> Result<(), WideColumnError>;
}

/// Wide-column table emulated with one PostgreSQL row per cell version
pub struct PgWideColumnStore {
    pool: PgPool,
}

impl PgWideColumnStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl WideColumnStore for PgWideColumnStore {
    #[instrument(skip(self, mutation), fields(cells = mutation.len()))]
    async fn write_fields(
        &self,
        row_key: &str,
        mutation: &RowMutation,
        timestamp: i64,
    ) -> Result<(), WideColumnError> {
        let mut tx = self.pool.begin().await?;

        for (family, column, value) in mutation.cells() {
            sqlx::query(
                r#"
                INSERT INTO post_cells (row_key, family, qualifier, ts, value)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (row_key, family, qualifier, ts)
                DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(row_key)
            .bind(family)
            .bind(column)
            .bind(timestamp)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(row_key = %row_key, "Row mutation applied");

        Ok(())
    }

    async fn read_row(&self, row_key: &str) -> Result<Option<Row>, WideColumnError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (family, qualifier) family, qualifier, value
            FROM post_cells
            WHERE row_key = $1
            ORDER BY family, qualifier, ts DESC
            "#,
        )
        .bind(row_key)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut cells = RowMutation::new();
        for row in rows {
            let family: String = row.try_get("family")?;
            let qualifier: String = row.try_get("qualifier")?;
            let value: Vec<u8> = row.try_get("value")?;
            cells.set(&family, &qualifier, value);
        }

        Ok(Some(Row {
            key: row_key.to_string(),
            cells,
        }))
    }

    async fn health_check(&self) -> Result<(), WideColumnError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(lat: f64, lon: f64) -> Post {
        Post::new(
            "550e8400-e29b-41d4-a716-446655440000".parse().unwrap(),
            "john",
            "hello",
            Location::new(lat, lon),
        )
    }

    #[test]
    fn test_mutation_layout() {
        let mutation = RowMutation::from(&post(37.0, -120.0));

        assert_eq!(mutation.len(), 4);
        assert_eq!(mutation.get("post", "user"), Some(&b"john"[..]));
        assert_eq!(mutation.get("post", "message"), Some(&b"hello"[..]));
        assert_eq!(mutation.get("location", "lat"), Some(&b"37"[..]));
        assert_eq!(mutation.get("location", "lon"), Some(&b"-120"[..]));
    }

    #[test]
    fn test_coordinates_survive_decimal_text() {
        let samples = [
            (37.0, -120.0),
            (37.774929123456789, -122.419415987654321),
            (0.1 + 0.2, -0.000_000_1),
            (-89.999_999_999_999_99, 179.999_999_999_999_97),
            (1e-300, -5e-324),
        ];

        for (lat, lon) in samples {
            let original = post(lat, lon);
            let row = Row {
                key: original.id.to_string(),
                cells: RowMutation::from(&original),
            };
            let restored = row.to_post().unwrap();

            assert_eq!(restored.location.lat.to_bits(), lat.to_bits());
            assert_eq!(restored.location.lon.to_bits(), lon.to_bits());
        }
    }

    #[test]
    fn test_decimal_text_has_no_exponent() {
        let mutation = RowMutation::from(&post(1e-7, 1e21));
        assert_eq!(mutation.get("location", "lat"), Some(&b"0.0000001"[..]));
        assert_eq!(
            mutation.get("location", "lon"),
            Some(&b"1000000000000000000000"[..])
        );
    }

    #[test]
    fn test_row_missing_column_is_malformed() {
        let mut cells = RowMutation::from(&post(1.0, 2.0));
        cells.cells.remove(&("location".to_string(), "lon".to_string()));
        let row = Row {
            key: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            cells,
        };

        match row.to_post() {
            Err(WideColumnError::MalformedRow { reason, .. }) => {
                assert!(reason.contains("location:lon"));
            }
            other => panic!("Expected MalformedRow, got {:?}", other),
        }
    }

    #[test]
    fn test_row_key_must_be_post_id() {
        let row = Row {
            key: "not-a-uuid".to_string(),
            cells: RowMutation::from(&post(1.0, 2.0)),
        };
        assert!(row.to_post().is_err());
    }
}
