pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod rooms;
pub mod session;

use std::sync::Arc;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{config::Config, db::Db, error::ChatError, hub::Hub, rooms::msg::Relay};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db: Db,
    pub clients: auth::Clients,
    pub hub: Hub,
    pub relay: Relay<Db>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: Db, clients: auth::Clients, config: Config) -> Self {
        let hub = Hub::new(config.outbox_capacity);
        let relay = Relay::new(db.clone(), hub.clone(), config.max_message_len);
        Self {
            db,
            clients,
            hub,
            relay,
            config: Arc::new(config),
        }
    }
}

/// Every route of the service, without the session layer.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(auth::router())
        .route("/api/ws", get(rooms::ws::group_ws))
        .nest("/api/groups", rooms::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
}

pub trait GetField {
    fn get_str_field(&self, field: &str) -> AppResult<String>;
    fn get_obj_field(&self, field: &str) -> AppResult<&Value>;
}

impl GetField for serde_json::Value {
    fn get_str_field(&self, field: &str) -> AppResult<String> {
        Ok(
            self.get(field)
            .ok_or(format!("expected {field} in response"))?
            .as_str()
            .ok_or(format!("expected {field} in response to be string"))?
            .to_owned()
        )
    }

    fn get_obj_field(&self, field: &str) -> AppResult<&Value> {
        self.get(field)
        .ok_or(format!("expected {field} in response").into())
    }
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(err) = self.0.downcast_ref::<ChatError>() {
            if !err.is_rejection() {
                tracing::error!(error = ?self.0, "request failed");
            }
            return (
                err.status(),
                Json(json!({ "error": err.code(), "message": err.to_string() })),
            )
                .into_response();
        }

        tracing::error!(error = ?self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal", "message": self.0.to_string() })),
        )
            .into_response()
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        Self(anyhow::Error::msg(err))
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        Self(anyhow::Error::msg(err.to_owned()))
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(ChatError);
apperr_impl!(serde_json::Error);
apperr_impl!(sqlx::Error);
apperr_impl!(tower_sessions::session::Error);
apperr_impl!(axum::Error);
apperr_impl!(reqwest::Error);
apperr_impl!(std::io::Error);
apperr_impl!(oauth2::url::ParseError);

impl<E: core::error::Error + Send + Sync + 'static, R: oauth2::ErrorResponse + Send + Sync + 'static> From<oauth2::RequestTokenError<E, R>> for AppError {
    fn from(err: oauth2::RequestTokenError<E, R>) -> Self {
        Self(anyhow::Error::from(err))
    }
}
