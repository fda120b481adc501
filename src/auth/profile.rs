use axum::{debug_handler, extract::State, Json};
use serde::Serialize;
use tower_sessions::Session;

use crate::{
    db::{Db, Identity},
    error::ChatError,
    session, AppResult,
};

#[derive(Serialize)]
pub(crate) struct Profile {
    user: Identity,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn profile(State(db): State<Db>, session: Session) -> AppResult<Json<Profile>> {
    match session::current_identity(&session, &db).await? {
        Some(user) => Ok(Json(Profile { user })),
        None => Err(ChatError::Unauthenticated)?,
    }
}
