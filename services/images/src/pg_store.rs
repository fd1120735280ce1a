use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::model::{DetectedObjectGroup, ImageRecord, ImageStatus, OwnerId};
use crate::query::{escape_like, ImageFilter, SortKey, SortOrder};
use crate::store::ImageStore;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const IMAGE_COLUMNS: &str = r#"
    id, owner, display_name, stored_path, detected_path,
    status, detections, created_at
"#;

/// Row layout of the `images` table
#[derive(Debug, FromRow)]
struct ImageRow {
    id: Uuid,
    owner: Uuid,
    display_name: String,
    stored_path: String,
    detected_path: Option<String>,
    status: String,
    detections: Json<Vec<DetectedObjectGroup>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ImageRow> for ImageRecord {
    type Error = StoreError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<ImageStatus>()
            .map_err(|message| StoreError::Corrupt { id: row.id, message })?;

        Ok(ImageRecord {
            id: row.id,
            owner: OwnerId(row.owner),
            display_name: row.display_name,
            stored_path: PathBuf::from(row.stored_path),
            detected_path: row.detected_path.map(PathBuf::from),
            status,
            detections: row.detections.0,
            created_at: row.created_at,
        })
    }
}

fn into_records(rows: Vec<ImageRow>) -> Result<Vec<ImageRecord>, StoreError> {
    rows.into_iter().map(ImageRecord::try_from).collect()
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Image store backed by PostgreSQL
pub struct PgImageStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgImageStore {
    /// Create a new store with connection pool
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self {
            pool,
            query_timeout: config.query_timeout(),
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }

    /// Bound a store operation by the configured query timeout
    async fn bounded<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        tokio::time::timeout(self.query_timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout(self.query_timeout))?
            .map_err(StoreError::from)
    }

    /// Resolve why a guarded status update touched no rows
    async fn rejected_transition(&self, id: Uuid, to: ImageStatus) -> StoreError {
        match self.get(id).await {
            Ok(Some(record)) => StoreError::InvalidTransition {
                id,
                from: record.status,
                to,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl ImageStore for PgImageStore {
    #[instrument(skip(self, record), fields(image_id = %record.id, owner = %record.owner))]
    async fn insert(&self, record: &ImageRecord) -> Result<(), StoreError> {
        self.bounded(
            sqlx::query(
                r#"
                INSERT INTO images (
                    id, owner, display_name, stored_path, detected_path,
                    status, detections, created_at
                ) VALUES (
                    $1, $2, $3, $4, $5,
                    $6, $7, $8
                )
                "#,
            )
            .bind(record.id)
            .bind(record.owner.0)
            .bind(&record.display_name)
            .bind(path_text(&record.stored_path))
            .bind(record.detected_path.as_deref().map(path_text))
            .bind(record.status.as_str())
            .bind(Json(&record.detections))
            .bind(record.created_at)
            .execute(&self.pool),
        )
        .await?;

        debug!("Image record inserted");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = $1");
        let row = self
            .bounded(
                sqlx::query_as::<_, ImageRow>(&sql)
                    .bind(id)
                    .fetch_optional(&self.pool),
            )
            .await?;

        row.map(ImageRecord::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        owner: OwnerId,
        filter: &ImageFilter,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        let mut sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE owner = $1");
        let mut param_count = 1;

        if filter.search.is_some() {
            param_count += 1;
            sql.push_str(&format!(
                " AND display_name ILIKE '%' || ${} || '%' ESCAPE '\\'",
                param_count
            ));
        }

        if filter.status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ${}", param_count));
        }

        if filter.created_after.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at >= ${}", param_count));
        }

        let direction = match filter.sort_order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        // Byte order on lowercased names, same as the in-memory store
        let order = match filter.sort_key {
            SortKey::CreatedAt => format!("created_at {direction}"),
            SortKey::DisplayName => format!(
                "lower(display_name) COLLATE \"C\" {direction}, display_name COLLATE \"C\" {direction}"
            ),
        };
        sql.push_str(&format!(" ORDER BY {order}, id {direction}"));

        let mut query_builder = sqlx::query_as::<_, ImageRow>(&sql).bind(owner.0);

        if let Some(ref search) = filter.search {
            query_builder = query_builder.bind(escape_like(search));
        }
        if let Some(status) = filter.status {
            query_builder = query_builder.bind(status.as_str());
        }
        if let Some(created_after) = filter.created_after {
            query_builder = query_builder.bind(created_after);
        }

        let rows = self.bounded(query_builder.fetch_all(&self.pool)).await?;
        into_records(rows)
    }

    async fn find_owned(&self, owner: OwnerId, ids: &[Uuid]) -> Result<Vec<ImageRecord>, StoreError> {
        let sql = format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE owner = $1 AND id = ANY($2) ORDER BY created_at"
        );
        let rows = self
            .bounded(
                sqlx::query_as::<_, ImageRow>(&sql)
                    .bind(owner.0)
                    .bind(ids)
                    .fetch_all(&self.pool),
            )
            .await?;

        into_records(rows)
    }

    #[instrument(skip(self))]
    async fn rename(&self, id: Uuid, display_name: &str) -> Result<(), StoreError> {
        let result = self
            .bounded(
                sqlx::query("UPDATE images SET display_name = $2 WHERE id = $1")
                    .bind(id)
                    .bind(display_name)
                    .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, detections), fields(groups = detections.len()))]
    async fn complete(
        &self,
        id: Uuid,
        detected_path: &Path,
        detections: &[DetectedObjectGroup],
    ) -> Result<(), StoreError> {
        let result = self
            .bounded(
                sqlx::query(
                    r#"
                    UPDATE images
                    SET status = $2, detected_path = $3, detections = $4
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(id)
                .bind(ImageStatus::Success.as_str())
                .bind(path_text(detected_path))
                .bind(Json(detections))
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, ImageStatus::Success).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_failed(&self, id: Uuid) -> Result<(), StoreError> {
        let result = self
            .bounded(
                sqlx::query("UPDATE images SET status = $2 WHERE id = $1 AND status = 'pending'")
                    .bind(id)
                    .bind(ImageStatus::Fail.as_str())
                    .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, ImageStatus::Fail).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = self
            .bounded(
                sqlx::query("DELETE FROM images WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn delete_owned(&self, owner: OwnerId, ids: &[Uuid]) -> Result<u64, StoreError> {
        let result = self
            .bounded(
                sqlx::query("DELETE FROM images WHERE owner = $1 AND id = ANY($2)")
                    .bind(owner.0)
                    .bind(ids)
                    .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected())
    }

    async fn stale_pending(&self, before: DateTime<Utc>) -> Result<Vec<ImageRecord>, StoreError> {
        let sql = format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE status = 'pending' AND created_at < $1"
        );
        let rows = self
            .bounded(
                sqlx::query_as::<_, ImageRow>(&sql)
                    .bind(before)
                    .fetch_all(&self.pool),
            )
            .await?;

        into_records(rows)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.bounded(sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map(|_| ())
    }
}
