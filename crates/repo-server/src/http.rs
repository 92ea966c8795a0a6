//! HTTP bootstrap surface.
//!
//! - `GET /`: liveness text
//! - `GET /keys`: the server's public identity, so a client can add the
//!   server to its team
//! - `POST /teams`: register a team (graph + keyring) the server belongs to

use crate::storage::SharesFile;
use axum::extract::{rejection::JsonRejection, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use repo_net::auth::{PublicIdentity, Team, TeamKeyring};
use repo_net::AuthProvider;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<AuthProvider>,
    pub shares: Arc<SharesFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRegistration {
    /// Team graph as JSON text.
    pub serialized_graph: String,
    pub team_keyring: TeamKeyring,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Internal(e) => {
                error!("Request failed: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/keys", get(keys))
        .route("/teams", post(register_team))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "repo-server is running"
}

async fn keys(State(state): State<AppState>) -> Json<PublicIdentity> {
    Json(state.provider.public_keys())
}

async fn register_team(
    State(state): State<AppState>,
    body: Result<Json<TeamRegistration>, JsonRejection>,
) -> Result<Json<PublicIdentity>, ApiError> {
    let Json(registration) = body?;
    let team: Team = serde_json::from_str(&registration.serialized_graph)
        .map_err(|e| ApiError::BadRequest(format!("invalid team graph: {}", e)))?;

    let keys = state.provider.public_keys();
    let listed = team
        .servers
        .iter()
        .any(|s| s.id == keys.id && s.public_key == keys.public_key);
    if !listed {
        return Err(ApiError::BadRequest(format!(
            "team {} does not list server {}",
            team.id, keys.id
        )));
    }

    let share_id = state.provider.add_share(team, registration.team_keyring);
    state.shares.save(&state.provider).map_err(ApiError::Internal)?;
    info!("Registered team {}", share_id);
    Ok(Json(keys))
}
