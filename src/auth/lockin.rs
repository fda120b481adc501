use axum::{debug_handler, extract::{Query, State}, response::Redirect};
use oauth2::{AuthorizationCode, CsrfToken, PkceCodeVerifier, TokenResponse};
use serde::Deserialize;
use tower_sessions::Session;

use crate::{
    db::Db,
    session::{CSRF_STATE, PKCE_VERIFIER, RETURN_URL, USER_ID},
    AppResult, GetField,
};

use super::{random_alias, Clients};

const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

#[derive(Deserialize)]
pub struct LockinQuery {
    pub state: Option<String>,
    pub code: Option<String>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn lockin(
    Query(LockinQuery { state, code }): Query<LockinQuery>,
    State(db): State<Db>,
    State(clients): State<Clients>,
    session: Session,
) -> AppResult<Redirect> {
    let state = CsrfToken::new(state.ok_or("OAuth: without state")?);
    let code = AuthorizationCode::new(code.ok_or("OAuth: without code")?);

    let Some(stored_state) = session.remove::<String>(CSRF_STATE).await? else {
        return Err("no csrf_state")?;
    };

    if state.secret().as_str() != stored_state.as_str() {
        return Err("csrf tokens don't match")?;
    }

    let Some(pkce_verifier) = session.remove::<String>(PKCE_VERIFIER).await? else {
        return Err("no pkce_verifier")?;
    };

    let client = clients.google()?;
    let http_client = reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let token_result = client
        .exchange_code(code)
        .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
        .request_async(&http_client)
        .await?;

    let body: serde_json::Value = http_client.get(USERINFO_URL)
        .bearer_auth(token_result.access_token().secret())
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let google_id = body.get_str_field("id")?;
    let email = body.get_str_field("email")?;
    let name = body.get_str_field("name").unwrap_or_else(|_| random_alias());
    let picture = body.get_str_field("picture").ok();

    let user_id = db.upsert_user(&google_id, &email, &name, picture.as_deref()).await?;
    session.cycle_id().await?;
    session.insert(USER_ID, user_id).await?;

    tracing::info!(user = user_id, "signed in");

    let return_url = session.remove::<String>(RETURN_URL).await?;
    Ok(Redirect::to(return_url.as_deref().unwrap_or("/")))
}
