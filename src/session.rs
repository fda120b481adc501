use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, Session, SessionManagerLayer};

use crate::{
    config::Config,
    db::{Db, Directory, Identity, UserId},
    AppResult,
};

pub const USER_ID: &str = "user_id";
pub const CSRF_STATE: &str = "csrf_state";
pub const PKCE_VERIFIER: &str = "pkce_verifier";
pub const RETURN_URL: &str = "return_url";

pub fn layer(config: &Config) -> SessionManagerLayer<MemoryStore> {
    SessionManagerLayer::new(MemoryStore::default())
        .with_secure(config.secure_cookies)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(config.session_minutes)))
}

/// The signed-in user, if the session carries one that still exists.
pub async fn current_identity(session: &Session, db: &Db) -> AppResult<Option<Identity>> {
    let Some(user_id) = session.get::<UserId>(USER_ID).await? else {
        return Ok(None);
    };
    Ok(db.identity(user_id).await?)
}
