//! Shared infrastructure for the Examly billing service.
//!
//! Database pool construction, embedded migrations, and the plan/feature
//! enums every crate agrees on.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create the standard database connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Create a pool for running migrations. Separate from the regular pool
/// because migrations need longer timeouts and must bypass PgBouncer
/// (prepared statements are not supported through transaction pooling).
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

/// Run embedded migrations against the given pool.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Subscription tier a user can be on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Premium,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Premium => "premium",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(PlanTier::Free),
            "premium" => Some(PlanTier::Premium),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metered product features gated by the usage counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// AI tutor chat messages
    TutorChat,
    /// Generated practice quizzes
    QuizGeneration,
    /// Study document uploads
    DocumentUpload,
}

impl Feature {
    pub const ALL: [Feature; 3] = [
        Feature::TutorChat,
        Feature::QuizGeneration,
        Feature::DocumentUpload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::TutorChat => "tutor_chat",
            Feature::QuizGeneration => "quiz_generation",
            Feature::DocumentUpload => "document_upload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tutor_chat" => Some(Feature::TutorChat),
            "quiz_generation" => Some(Feature::QuizGeneration),
            "document_upload" => Some(Feature::DocumentUpload),
            _ => None,
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips_through_strings() {
        for tier in [PlanTier::Free, PlanTier::Premium] {
            assert_eq!(PlanTier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(PlanTier::parse("enterprise"), None);
    }

    #[test]
    fn feature_round_trips_through_strings() {
        for feature in Feature::ALL {
            assert_eq!(Feature::parse(feature.as_str()), Some(feature));
        }
        assert_eq!(Feature::parse("essay_grading"), None);
    }
}
