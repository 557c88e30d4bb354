//! The user provisioning endpoint.

use crate::error::Error;
use crate::store::Store;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use rand::rngs::OsRng;
use rand::Rng;
use serde::Deserialize;

#[derive(Clone)]
struct AppState {
    store: Store,
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    email: String,
}

/// Runs the provisioning service on the specified address.
pub async fn run_http_server(addr: &str, store: Store) -> Result<(), Error> {
    let app = Router::new()
        .route("/create-user", post(create_user))
        .with_state(AppState { store });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("user service listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Registers a user with an argon2-hashed password and a bound sender
/// address.
async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> (StatusCode, &'static str) {
    if req.username.is_empty() || req.password.is_empty() || req.email.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "username, password and email are required",
        );
    }

    match state.store.user_exists(&req.username).await {
        Ok(false) => {}
        Ok(true) => return (StatusCode::BAD_REQUEST, "username exists"),
        Err(e) => {
            log::error!("user existence check failed: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "server failed");
        }
    }

    let salt: [u8; 16] = OsRng.gen();
    let hash = match argon2::hash_encoded(
        req.password.as_bytes(),
        &salt,
        &argon2::Config::default(),
    ) {
        Ok(hash) => hash,
        Err(e) => {
            log::error!("password hashing failed: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "hash error");
        }
    };

    match state.store.create_user(&req.username, &hash, &req.email).await {
        Ok(()) => {
            log::info!("user {} created", req.username);
            (StatusCode::OK, "User created")
        }
        Err(e) => {
            log::error!("failed to store user {}: {e}", req.username);
            (StatusCode::INTERNAL_SERVER_ERROR, "db error")
        }
    }
}
