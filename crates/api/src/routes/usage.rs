//! Usage endpoints and the request-time feature gate

use axum::extract::{Path, State};
use axum::Json;
use examly_shared::Feature;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn usage_summary(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<examly_billing::FeatureUsage>>, ApiError> {
    let summary = state.billing.usage.summary(user.id).await?;
    Ok(Json(summary))
}

#[derive(Debug, serde::Serialize)]
pub struct ConsumeResponse {
    pub feature: Feature,
    pub used_today: i64,
    /// None means unlimited
    pub daily_limit: Option<i64>,
}

/// Gate + count one feature use. App servers call this before serving a
/// tutor chat message, quiz generation, or document upload.
pub async fn consume_feature(
    State(state): State<AppState>,
    user: AuthUser,
    Path(feature): Path<String>,
) -> Result<Json<ConsumeResponse>, ApiError> {
    let feature = Feature::parse(&feature)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown feature '{}'", feature)))?;

    if !state.billing.usage.can_use(user.id, feature).await? {
        return Err(ApiError::LimitReached);
    }

    let used_today = state.billing.usage.increment(user.id, feature).await?;
    let daily_limit = match state.billing.usage.limit(user.id, feature).await? {
        examly_billing::FeatureLimit::Unlimited => None,
        examly_billing::FeatureLimit::Limited(cap) => Some(cap),
    };

    Ok(Json(ConsumeResponse {
        feature,
        used_today,
        daily_limit,
    }))
}
