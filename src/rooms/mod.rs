mod discover;
pub mod msg;
mod new;
mod room;
pub mod ws;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/discover", get(discover::discover))
        .route("/create", post(new::new_group))
        .route("/{group_id}/join", post(new::join_group))
        .route("/{group_id}/messages", get(room::messages))
        .route("/{group_id}/send-message", post(msg::send_msg))
}
