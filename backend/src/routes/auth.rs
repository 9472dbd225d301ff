use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use sqlx::PgPool;

use crate::auth::middleware::{AuthUser, COOKIE_NAME};
use crate::auth::{jwt, password};
use crate::error::AppError;
use crate::models::user::{AuthResponse, LoginRequest, RegisterRequest, User, UserResponse};
use crate::AppState;

const USER_COLUMNS: &str = "id, username, email, password_hash, created_at, updated_at";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
}

fn validate_registration(body: &RegisterRequest) -> Result<(), AppError> {
    let username_len = body.username.trim().chars().count();
    if !(3..=50).contains(&username_len) {
        return Err(AppError::BadRequest(
            "Username must be between 3 and 50 characters".into(),
        ));
    }
    if !body.email.contains('@') {
        return Err(AppError::BadRequest("Invalid email address".into()));
    }
    if body.password.len() < 6 {
        return Err(AppError::BadRequest(
            "Password must be at least 6 characters".into(),
        ));
    }
    Ok(())
}

/// Insert a new account. Shared by the register route and the `create-user` command.
pub async fn create_user(
    db: &PgPool,
    username: &str,
    email: &str,
    plain_password: &str,
) -> Result<User, AppError> {
    let password_hash = password::hash_password(plain_password)?;

    sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (username, email, password_hash)
         VALUES ($1, $2, $3)
         RETURNING {USER_COLUMNS}"
    ))
    .bind(username)
    .bind(email)
    .bind(&password_hash)
    .fetch_one(db)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, "Username or email already exists"))
}

/// Look up a user by name and check the password.
pub async fn authenticate(db: &PgPool, username: &str, plain_password: &str) -> Result<User, AppError> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
    ))
    .bind(username.trim())
    .fetch_optional(db)
    .await?
    .ok_or(AppError::InvalidCredentials)?;

    if !password::verify_password(plain_password, &user.password_hash)? {
        return Err(AppError::InvalidCredentials);
    }
    Ok(user)
}

async fn register(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<RegisterRequest>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    validate_registration(&body)?;

    let user = create_user(
        &state.db,
        body.username.trim(),
        body.email.trim(),
        &body.password,
    )
    .await?;
    tracing::info!(user_id = %user.id, "registered {}", user.username);

    issue_session(&state, jar, user)
}

async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<LoginRequest>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    let user = authenticate(&state.db, &body.username, &body.password).await?;
    issue_session(&state, jar, user)
}

async fn logout(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(COOKIE_NAME).path("/"))
}

async fn me(State(state): State<AppState>, auth: AuthUser) -> Result<Json<UserResponse>, AppError> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
    ))
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(AppError::Unauthorized)?;

    Ok(Json(UserResponse::from(user)))
}

fn issue_session(
    state: &AppState,
    jar: CookieJar,
    user: User,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    let token = jwt::create_token(user.id, &user.username, &state.config.jwt_secret)?;
    let cookie = build_auth_cookie(token.clone());

    Ok((
        jar.add(cookie),
        Json(AuthResponse {
            user: UserResponse::from(user),
            token,
        }),
    ))
}

fn build_auth_cookie(token: String) -> Cookie<'static> {
    Cookie::build((COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::hours(jwt::TOKEN_EXPIRY_HOURS))
        .build()
}
