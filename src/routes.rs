use std::sync::Arc;

use actix_web::{web, HttpResponse};

use crate::auth::{issue_token, Auth};
use crate::error::ApiError;
use crate::models::*;
use crate::password::{hash_password, verify_password};
use crate::quotes::QuoteService;
use crate::repo::{RepoError, UserRepo};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .service(web::resource("/auth/register").route(web::post().to(register)))
            .service(web::resource("/auth/login").route(web::post().to(login)))
            .service(web::resource("/auth/me").route(web::get().to(current_user)))
            // same handler; the dashboard calls it under /users
            .service(web::resource("/users/me").route(web::get().to(current_user)))
            .service(web::resource("/quotes").route(web::get().to(get_quotes)))
            .service(web::resource("/search").route(web::get().to(search_symbols))),
    );
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn UserRepo>,
    pub quotes: Arc<QuoteService>,
}

#[utoipa::path(
    post,
    path = "/api/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User created", body = UserResponse),
        (status = 400, description = "Validation failure"),
        (status = 409, description = "Email already in use")
    )
)]
pub async fn register(
    data: web::Data<AppState>,
    payload: web::Json<RegisterRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = payload.into_inner();
    req.validate().map_err(ApiError::Validation)?;

    let password_hash = hash_password(&req.password).map_err(|e| {
        // the error formats without the input; plaintext is never logged
        log::error!("password hashing failed: {e}");
        ApiError::Internal
    })?;

    let user = data
        .repo
        .create_user(NewUser {
            first_name: req.first_name,
            last_name: req.last_name,
            email: req.email,
            password_hash,
        })
        .await?;

    log::info!("registered user {}", user.id);
    Ok(HttpResponse::Created().json(UserResponse::from(&user)))
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token issued", body = AuthResponse),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login(
    data: web::Data<AppState>,
    payload: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    // unknown email and wrong password collapse into the same 401
    let user = data
        .repo
        .find_by_email(&payload.email)
        .await
        .map_err(|_| ApiError::InvalidCredentials)?;

    if !verify_password(&payload.password, &user.password_hash) {
        return Err(ApiError::InvalidCredentials);
    }

    let token = issue_token(user.id).map_err(|e| {
        log::error!("token issue failed: {e}");
        ApiError::Internal
    })?;

    Ok(HttpResponse::Ok().json(AuthResponse {
        token,
        user: UserResponse::from(&user),
    }))
}

#[utoipa::path(
    get,
    path = "/api/users/me",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Missing or invalid token"),
        (status = 404, description = "User no longer exists")
    )
)]
pub async fn current_user(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user_id = auth.0.user_id().ok_or(ApiError::NotFound)?;
    let user = data.repo.find_by_id(user_id).await.map_err(|e| match e {
        RepoError::NotFound => ApiError::NotFound,
        other => other.into(),
    })?;
    Ok(HttpResponse::Ok().json(UserResponse::from(&user)))
}

#[derive(serde::Deserialize)]
pub struct QuotesQuery {
    symbols: String,
}

#[utoipa::path(
    get,
    path = "/api/quotes",
    params(("symbols" = String, Query, description = "Comma-separated ticker symbols")),
    responses(
        (status = 200, description = "Per-symbol quote outcomes"),
        (status = 401, description = "Missing or invalid token")
    )
)]
pub async fn get_quotes(
    _auth: Auth,
    data: web::Data<AppState>,
    query: web::Query<QuotesQuery>,
) -> Result<HttpResponse, ApiError> {
    let quotes = data.quotes.get_quotes(&query.symbols).await;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "quotes": quotes })))
}

#[derive(serde::Deserialize)]
pub struct SearchQuery {
    q: String,
}

#[utoipa::path(
    get,
    path = "/api/search",
    params(("q" = String, Query, description = "Symbol search text")),
    responses(
        (status = 200, description = "Matching symbols", body = [SymbolMatch]),
        (status = 401, description = "Missing or invalid token"),
        (status = 502, description = "Upstream failure")
    )
)]
pub async fn search_symbols(
    _auth: Auth,
    data: web::Data<AppState>,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse, ApiError> {
    let matches = data
        .quotes
        .search(&query.q)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    Ok(HttpResponse::Ok().json(matches))
}
