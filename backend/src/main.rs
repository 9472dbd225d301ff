mod auth;
mod config;
mod error;
mod metadata;
mod models;
mod routes;
mod search;
mod storage;
mod thumbnails;

use std::error::Error;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use config::Config;
use sqlx::PgPool;
use storage::{LocalStorage, StorageBackend};
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;
use crate::search::PgImageStore;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<Config>,
    pub storage: StorageBackend,
    pub image_store: PgImageStore,
}

#[derive(Parser)]
#[command(about = "Personal image library server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Create an account; the password is read from the terminal
    CreateUser {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
    },
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&state.db).await?;
    Ok(Json(serde_json::json!({ "status": "ok", "db": row.0 == 1 })))
}

fn build_app(state: AppState) -> Router {
    let config = state.config.clone();

    let mut app = Router::new()
        .route("/api/health", get(health))
        .merge(routes::api_router(config.max_upload_size));

    if let Some(upload_dir) = state.storage.local_upload_dir() {
        app = app.nest_service("/api/files", ServeDir::new(upload_dir));
    }

    if let Some(static_dir) = &config.static_dir {
        let index = format!("{static_dir}/index.html");
        app = app.fallback_service(ServeDir::new(static_dir).fallback(ServeFile::new(index)));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn create_user(db: &PgPool, username: &str, email: &str) -> Result<(), Box<dyn Error>> {
    let password = rpassword::prompt_password("Password: ")?;
    if password.len() < 6 {
        return Err("password must be at least 6 characters".into());
    }
    let user = routes::auth::create_user(db, username, email, &password).await?;
    println!("Created user {} ({})", user.username, user.id);
    Ok(())
}

async fn serve(config: Config, db: PgPool) -> Result<(), Box<dyn Error>> {
    let storage = StorageBackend::Local(LocalStorage::new(&config.upload_dir));
    let addr = format!("{}:{}", config.host, config.port);

    let state = AppState {
        image_store: PgImageStore::new(db.clone()),
        db,
        config: Arc::new(config),
        storage,
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, build_app(state)).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let db = PgPool::connect(&config.database_url).await?;
    sqlx::migrate!().run(&db).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, db).await,
        Command::CreateUser { username, email } => create_user(&db, &username, &email).await,
    }
}
