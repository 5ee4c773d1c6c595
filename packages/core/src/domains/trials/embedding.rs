//! `trial_embeddings`: one pgvector row per active trial. Grounded on
//! `common::embedding::Embeddable`'s `update_embedding`/`search_by_similarity`
//! shape, specialized to a string primary key (`trial_key`) instead of a
//! `Uuid`.

use anyhow::Result;
use pgvector::Vector;
use sqlx::PgPool;
use tracing::instrument;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EmbeddingCandidate {
    pub trial_key: String,
    pub similarity: f64,
}

pub struct TrialEmbeddingRepository {
    pool: PgPool,
}

impl TrialEmbeddingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Whether the stored embedding is stale relative to the trial's
    /// current derived text (§3's `TrialEmbedding` staleness invariant).
    pub async fn is_stale(&self, trial_key: &str, current_hash: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT source_text_hash FROM trial_embeddings WHERE trial_key = $1")
                .bind(trial_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(match row {
            Some((hash,)) => hash != current_hash,
            None => true,
        })
    }

    #[instrument(skip(self, embedding))]
    pub async fn upsert(&self, trial_key: &str, embedding: &[f32], source_text_hash: &str) -> Result<()> {
        let vector = Vector::from(embedding.to_vec());
        sqlx::query(
            r#"
            INSERT INTO trial_embeddings (trial_key, vector, source_text_hash, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (trial_key) DO UPDATE SET
                vector = EXCLUDED.vector,
                source_text_hash = EXCLUDED.source_text_hash,
                updated_at = NOW()
            "#,
        )
        .bind(trial_key)
        .bind(vector)
        .bind(source_text_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cosine ANN search used by the matcher's vector pass (§4.9 step 3).
    /// Mirrors `find_members_statewide`'s `1 - (embedding <=> $1)` shape.
    #[instrument(skip(self, query_embedding))]
    pub async fn search_by_similarity(
        &self,
        query_embedding: &[f32],
        match_threshold: f64,
        limit: i64,
    ) -> Result<Vec<EmbeddingCandidate>> {
        let vector = Vector::from(query_embedding.to_vec());
        let rows = sqlx::query_as::<_, EmbeddingCandidate>(
            r#"
            SELECT e.trial_key, 1 - (e.vector <=> $1) AS similarity
            FROM trial_embeddings e
            JOIN clinical_trials t ON t.trial_key = e.trial_key
            WHERE t.is_active = true AND 1 - (e.vector <=> $1) >= $2
            ORDER BY similarity DESC
            LIMIT $3
            "#,
        )
        .bind(vector)
        .bind(match_threshold)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
