use chrono::{DateTime, Utc};
use gleaner_core::error::AppError;
use gleaner_core::models::{Product, UpsertOutcome};
use gleaner_core::traits::ProductStore;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// Repository for harvested products in PostgreSQL.
///
/// One row per `(store, product_url)`. Re-harvesting a product overwrites its
/// mutable fields and only bumps `updated_at` when the content hash changed.
#[derive(Clone)]
pub struct ProductRepository {
    pool: Pool<Postgres>,
}

/// A product row as stored.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredProduct {
    pub id: Uuid,
    pub store: String,
    pub source_category: String,
    pub name: String,
    pub product_url: String,
    pub price: Option<String>,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub category: String,
    pub color: String,
    pub pattern: String,
    pub gender: String,
    pub sleeve_length: Option<String>,
    pub neckline: Option<String>,
    pub length: Option<String>,
    pub category_confidence: f32,
    pub color_confidence: f32,
    pub pattern_confidence: f32,
    pub gender_confidence: f32,
    pub sleeve_length_confidence: Option<f32>,
    pub neckline_confidence: Option<f32>,
    pub length_confidence: Option<f32>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or update a product, reporting which one happened.
    ///
    /// An unchanged product matches no row in the `DO UPDATE ... WHERE` and
    /// returns nothing; it still counts as an update.
    pub async fn upsert(&self, product: &Product) -> Result<UpsertOutcome, AppError> {
        let labels = &product.classification;
        let inserted: Option<(bool,)> = sqlx::query_as(
            r#"
            INSERT INTO products (
                store, source_category, name, product_url, price, image_url, description,
                category, color, pattern, gender, sleeve_length, neckline, length,
                category_confidence, color_confidence, pattern_confidence, gender_confidence,
                sleeve_length_confidence, neckline_confidence, length_confidence, content_hash
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22
            )
            ON CONFLICT (store, product_url) DO UPDATE SET
                source_category = EXCLUDED.source_category,
                name = EXCLUDED.name,
                price = EXCLUDED.price,
                image_url = EXCLUDED.image_url,
                description = EXCLUDED.description,
                category = EXCLUDED.category,
                color = EXCLUDED.color,
                pattern = EXCLUDED.pattern,
                gender = EXCLUDED.gender,
                sleeve_length = EXCLUDED.sleeve_length,
                neckline = EXCLUDED.neckline,
                length = EXCLUDED.length,
                category_confidence = EXCLUDED.category_confidence,
                color_confidence = EXCLUDED.color_confidence,
                pattern_confidence = EXCLUDED.pattern_confidence,
                gender_confidence = EXCLUDED.gender_confidence,
                sleeve_length_confidence = EXCLUDED.sleeve_length_confidence,
                neckline_confidence = EXCLUDED.neckline_confidence,
                length_confidence = EXCLUDED.length_confidence,
                content_hash = EXCLUDED.content_hash,
                updated_at = NOW()
            WHERE products.content_hash IS DISTINCT FROM EXCLUDED.content_hash
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&product.store)
        .bind(&product.source_category)
        .bind(&product.name)
        .bind(&product.product_url)
        .bind(&product.price)
        .bind(&product.image_url)
        .bind(&product.description)
        .bind(&labels.category)
        .bind(&labels.color)
        .bind(&labels.pattern)
        .bind(&labels.gender)
        .bind(&labels.sleeve_length)
        .bind(&labels.neckline)
        .bind(&labels.length)
        .bind(labels.confidence.category)
        .bind(labels.confidence.color)
        .bind(labels.confidence.pattern)
        .bind(labels.confidence.gender)
        .bind(labels.confidence.sleeve_length)
        .bind(labels.confidence.neckline)
        .bind(labels.confidence.length)
        .bind(product.content_hash())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(match inserted {
            Some((true,)) => UpsertOutcome::Inserted,
            _ => UpsertOutcome::Updated,
        })
    }

    pub async fn get(
        &self,
        store: &str,
        product_url: &str,
    ) -> Result<Option<StoredProduct>, AppError> {
        sqlx::query_as::<_, StoredProduct>(
            r#"
            SELECT id, store, source_category, name, product_url, price, image_url, description,
                   category, color, pattern, gender, sleeve_length, neckline, length,
                   category_confidence, color_confidence, pattern_confidence, gender_confidence,
                   sleeve_length_confidence, neckline_confidence, length_confidence,
                   content_hash, created_at, updated_at
            FROM products
            WHERE store = $1 AND product_url = $2
            "#,
        )
        .bind(store)
        .bind(product_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    /// Number of products of one store, or of all stores.
    pub async fn count(&self, store: Option<&str>) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM products WHERE $1::VARCHAR IS NULL OR store = $1",
        )
        .bind(store)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.0)
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

/// Lost connections are transient; everything else is a database error.
fn map_sqlx_error(e: sqlx::Error) -> AppError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            AppError::NetworkError(format!("Database unavailable: {e}"))
        }
        other => AppError::DatabaseError(other.to_string()),
    }
}

// -- Trait implementation --

impl ProductStore for ProductRepository {
    async fn upsert(&self, product: &Product) -> Result<UpsertOutcome, AppError> {
        ProductRepository::upsert(self, product).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_are_transient() {
        let err = map_sqlx_error(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());

        let err = map_sqlx_error(sqlx::Error::RowNotFound);
        assert!(matches!(err, AppError::DatabaseError(_)));
        assert!(!err.is_retryable());
    }
}
