use axum::{debug_handler, extract::{Path, Query, State}, Json};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;

use crate::{
    config::Config,
    db::{Db, GroupId, GroupMessage},
    session, AppResult, AppState,
};

use super::msg::Relay;

#[derive(Deserialize)]
pub(crate) struct HistoryQuery {
    after: Option<i64>,
    limit: Option<i64>,
}

#[derive(Serialize)]
pub(crate) struct History {
    messages: Vec<GroupMessage>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn messages(
    Path(group_id): Path<GroupId>,
    Query(HistoryQuery { after, limit }): Query<HistoryQuery>,
    State(db): State<Db>,
    State(relay): State<Relay<Db>>,
    State(config): State<std::sync::Arc<Config>>,
    session: Session,
) -> AppResult<Json<History>> {
    let identity = session::current_identity(&session, &db).await?;
    let max = config.history_limit.max(1);
    let limit = limit.unwrap_or(max).clamp(1, max);

    let messages = relay.history(identity.as_ref(), group_id, after, limit).await?;

    Ok(Json(History { messages }))
}
