use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{CreateLinkRequest, EventRecord, Link, RedirectMode};
use crate::storage::{LinkEventStats, Storage, StorageError};

pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub default_redirect: RedirectMode,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    pub created_by: Option<String>,
}

fn default_limit() -> i64 {
    50
}

const GENERATED_ALIAS_LEN: usize = 7;
const MAX_ALIAS_LEN: usize = 20;

const ALIAS_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random alias
fn generate_alias() -> String {
    use rand::RngExt;
    let mut rng = rand::rng();
    (0..GENERATED_ALIAS_LEN)
        .map(|_| ALIAS_ALPHABET[rng.random_range(0..ALIAS_ALPHABET.len())] as char)
        .collect()
}

fn valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias.len() <= MAX_ALIAS_LEN
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Create a new link
pub async fn create_link(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateLinkRequest>,
) -> Result<(StatusCode, Json<Link>), (StatusCode, Json<ErrorResponse>)> {
    if !payload.url.starts_with("http://") && !payload.url.starts_with("https://") {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "URL must be absolute http or https".to_string(),
            }),
        ));
    }

    let redirect_status = payload
        .redirect
        .unwrap_or(state.default_redirect)
        .status_i64();
    let created_by = payload.created_by.as_deref();

    if let Some(custom) = &payload.alias {
        // Validate custom alias
        if !valid_alias(custom) {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "Alias must be 1-20 characters, alphanumeric, '-' or '_'".to_string(),
                }),
            ));
        }

        return match state
            .storage
            .create_link(custom, &payload.url, redirect_status, payload.expires_at, created_by)
            .await
        {
            Ok(link) => Ok((StatusCode::CREATED, Json(link))),
            Err(StorageError::Conflict) => Err((
                StatusCode::CONFLICT,
                Json(ErrorResponse {
                    error: "Alias already exists".to_string(),
                }),
            )),
            Err(e) => Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("Failed to create link: {}", e),
                }),
            )),
        };
    }

    // Insert and retry on collision, the unique index arbitrates.
    for _ in 0..10 {
        let alias = generate_alias();
        match state
            .storage
            .create_link(&alias, &payload.url, redirect_status, payload.expires_at, created_by)
            .await
        {
            Ok(link) => return Ok((StatusCode::CREATED, Json(link))),
            Err(StorageError::Conflict) => continue,
            Err(e) => {
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: format!("Failed to create link: {}", e),
                    }),
                ))
            }
        }
    }

    Err((
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Failed to generate unique alias".to_string(),
        }),
    ))
}

/// Get a link by alias
pub async fn get_link(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
) -> Result<Json<Link>, (StatusCode, Json<ErrorResponse>)> {
    // Bypass the read cache so the click count reflects the database plus
    // any buffered increments.
    match state.storage.link_by_alias_authoritative(&alias).await {
        Ok(Some(link)) => Ok(Json(link)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Link not found".to_string(),
            }),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("Failed to get link: {}", e),
            }),
        )),
    }
}

/// Deactivate a link
pub async fn deactivate_link(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.storage.deactivate_link(&alias).await {
        Ok(true) => Ok(Json(SuccessResponse {
            message: "Link deactivated successfully".to_string(),
        })),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Link not found".to_string(),
            }),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("Failed to deactivate link: {}", e),
            }),
        )),
    }
}

/// Reactivate a link
pub async fn reactivate_link(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.storage.reactivate_link(&alias).await {
        Ok(true) => Ok(Json(SuccessResponse {
            message: "Link reactivated successfully".to_string(),
        })),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Link not found".to_string(),
            }),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("Failed to reactivate link: {}", e),
            }),
        )),
    }
}

/// List links
pub async fn list_links(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Link>>, (StatusCode, Json<ErrorResponse>)> {
    let limit = query.limit.clamp(1, 500);
    match state
        .storage
        .list_links(limit, query.offset.max(0), query.created_by.as_deref())
        .await
    {
        Ok(links) => Ok(Json(links)),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("Failed to list links: {}", e),
            }),
        )),
    }
}

#[derive(Serialize)]
pub struct LinkStatsResponse {
    pub link: Link,
    pub stats: LinkEventStats,
    pub recent_events: Vec<EventRecord>,
}

/// Counter plus recorded-event aggregates and a capped slice of recent
/// events. The counter and the event count drift apart under load, the
/// counter is the approximate one.
pub async fn link_stats(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<LinkStatsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let link = match state.storage.link_by_alias_authoritative(&alias).await {
        Ok(Some(link)) => link,
        Ok(None) => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: "Link not found".to_string(),
                }),
            ))
        }
        Err(e) => {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("Failed to get link: {}", e),
                }),
            ))
        }
    };

    let limit = query.limit.clamp(1, 200);
    let stats = state.storage.link_event_stats(link.id).await;
    let recent = state
        .storage
        .events_for_link(link.id, limit, query.offset.max(0))
        .await;

    match (stats, recent) {
        (Ok(stats), Ok(recent_events)) => Ok(Json(LinkStatsResponse {
            link,
            stats,
            recent_events,
        })),
        (Err(e), _) | (_, Err(e)) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("Failed to load stats: {}", e),
            }),
        )),
    }
}

/// Health check endpoint
pub async fn health_check() -> Json<SuccessResponse> {
    Json(SuccessResponse {
        message: "OK".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_alias_shape() {
        let alias = generate_alias();
        assert_eq!(alias.len(), GENERATED_ALIAS_LEN);
        assert!(valid_alias(&alias));
    }

    #[test]
    fn test_alias_validation() {
        assert!(valid_alias("abc"));
        assert!(valid_alias("my-link_1"));
        assert!(!valid_alias(""));
        assert!(!valid_alias("has space"));
        assert!(!valid_alias("sl/ash"));
        assert!(!valid_alias(&"x".repeat(21)));
    }
}
