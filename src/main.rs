use anyhow::Context;
use buddyboard::{auth, config::Config, db::Db, router, session, AppState};
use sqlx::sqlite::SqlitePoolOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "buddyboard=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.database_url))?;
    let db = Db::new(db_pool);
    db.migrate().await.context("failed to run migrations")?;

    let clients = auth::Clients::from_file(&config.client_secret_path, &config.oauth_redirect_url)
        .map_err(|err| err.0)
        .context("failed to load oauth credentials")?;

    let session_layer = session::layer(&config);
    let bind_addr = config.bind_addr;
    let app = router()
        .with_state(AppState::new(db, clients, config))
        .layer(session_layer);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
