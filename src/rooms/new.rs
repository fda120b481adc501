use axum::{debug_handler, extract::{Path, State}, Json};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;

use crate::{
    db::{Db, GroupId},
    error::ChatError,
    session, AppResult,
};

#[derive(Debug, Deserialize)]
pub(crate) struct NewGroupQuery {
    name: String,
    description: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct NewGroup {
    id: GroupId,
}

#[derive(Debug, Serialize)]
pub(crate) struct Joined {
    group_id: GroupId,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn new_group(
    State(db): State<Db>,
    session: Session,

    Json(NewGroupQuery { name, description }): Json<NewGroupQuery>,
) -> AppResult<Json<NewGroup>> {
    let Some(identity) = session::current_identity(&session, &db).await? else {
        return Err(ChatError::Unauthenticated)?;
    };

    let name = name.trim();
    if name.is_empty() {
        return Err("group name is empty")?;
    }

    let id = db
        .create_group(name, description.as_deref(), identity.user_id)
        .await?;
    tracing::info!(group = id, user = identity.user_id, "group created");

    Ok(Json(NewGroup { id }))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn join_group(
    Path(group_id): Path<GroupId>,
    State(db): State<Db>,
    session: Session,
) -> AppResult<Json<Joined>> {
    let Some(identity) = session::current_identity(&session, &db).await? else {
        return Err(ChatError::Unauthenticated)?;
    };

    if !db.add_member(group_id, identity.user_id).await? {
        return Err(ChatError::RoomNotFound(group_id))?;
    }

    Ok(Json(Joined { group_id }))
}
