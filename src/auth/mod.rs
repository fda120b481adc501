use axum::{routing::get, Router};
use rand::seq::IndexedRandom;

use crate::AppState;

mod clients;
mod lockin;
mod login;
mod logout;
mod profile;

pub use clients::Clients;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/google/login", get(login::login))
        .route("/api/google/callback", get(lockin::lockin))
        .route("/api/logout", get(logout::logout))
        .route("/api/profile", get(profile::profile))
}

/// Display name for accounts whose provider did not share one.
pub(crate) fn random_alias() -> String {
    let adjectives = [
        "Quick", "Lazy", "Mysterious", "Jolly", "Brave", "Silent", "Witty", "Fierce",
        "Clever", "Gentle", "Wild", "Calm", "Bold", "Shy", "Proud", "Happy", "Sad",
        "Eager", "Fancy", "Rusty", "Golden", "Silver", "Bright", "Dark", "Lucky",
    ];

    let nouns = [
        "Fox", "Bear", "Eagle", "Wolf", "Dragon", "Tiger", "Lion", "Owl", "Rabbit",
        "Falcon", "Hawk", "Shark", "Panda", "Kitten", "Puppy", "Phoenix", "Griffin",
        "Unicorn", "Turtle", "Dolphin", "Whale", "Elephant", "Giraffe", "Zebra",
    ];

    let mut rng = rand::rng();
    match (adjectives.choose(&mut rng), nouns.choose(&mut rng)) {
        (Some(adjective), Some(noun)) => format!("{adjective} {noun}"),
        _ => "Anonymous".to_owned(),
    }
}
