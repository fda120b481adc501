use axum::{debug_handler, extract::State, Json};
use serde::Serialize;
use tower_sessions::Session;

use crate::{
    db::{Db, GroupSummary},
    error::ChatError,
    session, AppResult,
};

#[derive(Serialize)]
pub(crate) struct Discovered {
    groups: Vec<GroupSummary>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn discover(State(db): State<Db>, session: Session) -> AppResult<Json<Discovered>> {
    let Some(identity) = session::current_identity(&session, &db).await? else {
        return Err(ChatError::Unauthenticated)?;
    };

    let groups = db.discover(identity.user_id).await?;
    Ok(Json(Discovered { groups }))
}
