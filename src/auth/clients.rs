use std::path::Path;

use oauth2::{basic::BasicClient, AuthUrl, Client, ClientId, ClientSecret, RedirectUrl, TokenUrl};
use serde_json::Value;

use crate::{AppResult, GetField};

pub type HappyClient = Client<oauth2::StandardErrorResponse<oauth2::basic::BasicErrorResponseType>, oauth2::StandardTokenResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>, oauth2::StandardTokenIntrospectionResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>, oauth2::StandardRevocableToken, oauth2::StandardErrorResponse<oauth2::RevocationErrorResponseType>, oauth2::EndpointSet, oauth2::EndpointNotSet, oauth2::EndpointNotSet, oauth2::EndpointNotSet, oauth2::EndpointSet>;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// OAuth clients the server can sign users in with. Empty when no
/// credentials were supplied, in which case login is refused.
#[derive(Clone, Default)]
pub struct Clients {
    google: Option<HappyClient>,
}

impl Clients {
    /// Reads a Google `client_secret.json` download (`{"web": {...}}`).
    pub fn from_json(json: Value, redirect_url: &str) -> AppResult<Clients> {
        let json = json.get_obj_field("web")?;
        let client_id = ClientId::new(json.get_str_field("client_id")?);
        let client_secret = ClientSecret::new(json.get_str_field("client_secret")?);

        let google = BasicClient::new(client_id)
            .set_client_secret(client_secret)
            .set_auth_uri(AuthUrl::new(GOOGLE_AUTH_URL.to_owned())?)
            .set_token_uri(TokenUrl::new(GOOGLE_TOKEN_URL.to_owned())?)
            .set_redirect_uri(RedirectUrl::new(redirect_url.to_owned())?);

        Ok(Clients { google: Some(google) })
    }

    pub fn from_file(path: &Path, redirect_url: &str) -> AppResult<Clients> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "no oauth credentials, google login disabled");
            return Ok(Clients::default());
        }
        let json = serde_json::from_slice(&std::fs::read(path)?)?;
        Clients::from_json(json, redirect_url)
    }

    pub fn google(&self) -> AppResult<HappyClient> {
        self.google
            .clone()
            .ok_or("google oauth keys not supplied".into())
    }
}
