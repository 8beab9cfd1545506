pub mod auth;
mod config;

use crate::server::auth::AuthCtx;
use crate::storage::{self, StorageError, TaskChanges};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware;
use axum::response::Response as AxumResponse;
use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{Method, StatusCode, header},
    routing::{get, post},
};
use bcrypt::verify;
use chrono::{NaiveDate, NaiveDateTime, Utc};
pub use config::AppConfig;
use focusflow_shared::api;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Span, info_span};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: storage::Store,
}

impl AppState {
    pub fn new(config: AppConfig, store: storage::Store) -> Self {
        Self { config, store }
    }
}

#[derive(Clone, Debug)]
struct ReqId(pub String);

pub fn router(state: AppState) -> Router {
    let private = Router::new()
        .route("/api/me", get(api_me))
        .route("/api/tasks", get(api_list_tasks).post(api_create_task))
        .route(
            "/api/tasks/{id}",
            axum::routing::patch(api_update_task).delete(api_delete_task),
        )
        .route("/api/focus-sessions", post(api_start_session))
        .route("/api/focus-sessions/{id}/end", post(api_end_session))
        .route("/api/stats", get(api_stats))
        .with_state(state.clone())
        .layer(middleware::from_fn(set_auth_span_fields))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    // Trace with request context (method, path, request_id)
    let trace = TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
        let request_id = req
            .extensions()
            .get::<ReqId>()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id,
            user_id = tracing::field::Empty
        )
    });

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/api/auth/signup", post(api_auth_signup))
        .route("/api/auth/signin", post(api_auth_signin))
        .merge(private)
        .with_state(state.clone())
        .layer(trace)
        .layer(middleware::from_fn(add_security_headers))
        .layer(middleware::from_fn(add_request_id));

    // Optionally add CORS for dev if configured

    if let Some(origin) = &state.config.dev_cors_origin {
        let hv = header::HeaderValue::from_str(origin)
            .unwrap_or(header::HeaderValue::from_static("http://localhost:5173"));
        let cors = CorsLayer::new()
            .allow_origin(hv)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
        app.layer(cors)
    } else {
        app
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn add_request_id(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let hdr = HeaderName::from_static("x-request-id");
    // Use provided x-request-id if present, else generate
    let rid = req
        .headers()
        .get(&hdr)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    // Put into request extensions for trace layer & handlers
    req.extensions_mut().insert(ReqId(rid.clone()));
    // Call next
    let mut resp = next.run(req).await;
    // Set header on response
    if let Ok(hv) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert(hdr, hv);
    }
    Ok(resp)
}

async fn add_security_headers(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let path = req.uri().path().to_string();
    let mut resp = next.run(req).await;

    // General security headers for all responses
    let headers = resp.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("SAMEORIGIN"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );

    // Disable caching for API and health endpoints
    if path == "/healthz" || path.starts_with("/api/") || path == "/api" {
        headers.insert(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
        );
        headers.insert(
            HeaderName::from_static("pragma"),
            HeaderValue::from_static("no-cache"),
        );
    }

    Ok(resp)
}

async fn set_auth_span_fields(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    if let Some(auth) = req.extensions().get::<AuthCtx>() {
        let span = Span::current();
        span.record("user_id", auth.user_id());
    }
    Ok(next.run(req).await)
}

async fn api_auth_signup(
    State(state): State<AppState>,
    Json(body): Json<api::SignUpReq>,
) -> Result<Json<api::AuthResp>, AppError> {
    let email = body.email.trim();
    if !is_plausible_email(email) {
        return Err(AppError::bad_request("invalid email address"));
    }
    if body.password.len() < 6 {
        return Err(AppError::bad_request(
            "password must be at least 6 characters",
        ));
    }
    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }

    let hash =
        bcrypt::hash(&body.password, bcrypt::DEFAULT_COST).map_err(AppError::internal)?;
    let user = state.store.create_user(email, name, &hash).await?;
    let token = auth::issue_jwt_for_user(&state, user.id).await?;
    Ok(Json(api::AuthResp {
        user: user_dto(&user),
        token,
    }))
}

async fn api_auth_signin(
    State(state): State<AppState>,
    Json(body): Json<api::SignInReq>,
) -> Result<Json<api::AuthResp>, AppError> {
    // Unknown email and wrong password are deliberately indistinguishable.
    let user = state
        .store
        .get_user_by_email(body.email.trim())
        .await?
        .ok_or_else(|| {
            tracing::warn!(email=%body.email, "signin: unknown email");
            AppError::unauthorized()
        })?;
    if !verify(&body.password, &user.password_hash).map_err(|e| {
        tracing::error!(user_id=user.id, error=%e, "signin: bcrypt verify failed");
        AppError::internal(e)
    })? {
        tracing::warn!(user_id = user.id, "signin: invalid password");
        return Err(AppError::unauthorized());
    }
    let token = auth::issue_jwt_for_user(&state, user.id).await?;
    Ok(Json(api::AuthResp {
        user: user_dto(&user),
        token,
    }))
}

async fn api_me(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<api::UserDto>, AppError> {
    let user = state
        .store
        .get_user_by_id(auth.user_id())
        .await?
        .ok_or_else(AppError::unauthorized)?;
    Ok(Json(user_dto(&user)))
}

async fn api_create_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Json(body): Json<api::CreateTaskReq>,
) -> Result<Json<api::TaskDto>, AppError> {
    let title = body.title.trim();
    if title.is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }
    if let Some(mins) = body.estimated_minutes
        && mins <= 0
    {
        return Err(AppError::bad_request("estimated_minutes must be positive"));
    }
    let scheduled_date = match body.scheduled_date.as_deref() {
        Some(s) => parse_date(s)?,
        None => Utc::now().date_naive(),
    };

    let task = state
        .store
        .create_task(
            auth.user_id(),
            title,
            body.description.as_deref(),
            body.estimated_minutes,
            scheduled_date,
        )
        .await?;
    Ok(Json(task_dto(&task)))
}

#[derive(Deserialize)]
struct DateQuery {
    date: Option<String>,
}

async fn api_list_tasks(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Query(q): Query<DateQuery>,
) -> Result<Json<Vec<api::TaskDto>>, AppError> {
    let date = q.date.as_deref().map(parse_date).transpose()?;
    let rows = state.store.list_tasks(auth.user_id(), date).await?;
    let items = rows.iter().map(task_dto).collect();
    Ok(Json(items))
}

async fn api_update_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<i32>,
    Json(body): Json<api::TaskPatch>,
) -> Result<Json<api::TaskDto>, AppError> {
    if let Some(title) = &body.title
        && title.trim().is_empty()
    {
        return Err(AppError::bad_request("title must not be empty"));
    }
    if let Some(Some(mins)) = body.estimated_minutes
        && mins <= 0
    {
        return Err(AppError::bad_request("estimated_minutes must be positive"));
    }
    let scheduled_date = body
        .scheduled_date
        .as_deref()
        .map(parse_date)
        .transpose()?;

    let changes = TaskChanges {
        title: body.title.map(|t| t.trim().to_string()),
        description: body.description,
        estimated_minutes: body.estimated_minutes,
        completed: body.completed,
        scheduled_date,
    };
    let task = state.store.update_task(auth.user_id(), id, changes).await?;
    Ok(Json(task_dto(&task)))
}

async fn api_delete_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<i32>,
) -> Result<StatusCode, AppError> {
    state.store.delete_task(auth.user_id(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_start_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Json(body): Json<api::StartSessionReq>,
) -> Result<Json<api::FocusSessionDto>, AppError> {
    if let Some(mins) = body.planned_minutes
        && mins <= 0
    {
        return Err(AppError::bad_request("planned_minutes must be positive"));
    }
    let session = state
        .store
        .start_session(auth.user_id(), body.task_id, body.planned_minutes)
        .await?;
    Ok(Json(session_dto(&session)))
}

async fn api_end_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<i32>,
    Json(body): Json<api::EndSessionReq>,
) -> Result<Json<api::FocusSessionDto>, AppError> {
    if let Some(mins) = body.duration_minutes
        && mins < 0
    {
        return Err(AppError::bad_request("duration_minutes must not be negative"));
    }
    let session = state
        .store
        .end_session(auth.user_id(), id, body.duration_minutes, body.completed)
        .await?;
    Ok(Json(session_dto(&session)))
}

async fn api_stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Query(q): Query<DateQuery>,
) -> Result<Json<api::StatsDto>, AppError> {
    let date = q.date.as_deref().map(parse_date).transpose()?;
    let stats = state.store.user_stats(auth.user_id(), date).await?;
    Ok(Json(api::StatsDto {
        total_tasks: stats.total_tasks,
        completed_tasks: stats.completed_tasks,
        total_focus_minutes: stats.total_focus_minutes,
        current_streak: stats.current_streak,
        active_session: stats.active_session.as_ref().map(session_dto),
    }))
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| AppError::bad_request(format!("invalid date: {s}, expected YYYY-MM-DD")))
}

fn rfc3339(dt: NaiveDateTime) -> String {
    chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(dt, chrono::Utc).to_rfc3339()
}

fn user_dto(u: &crate::storage::models::User) -> api::UserDto {
    api::UserDto {
        id: u.id,
        email: u.email.clone(),
        name: u.name.clone(),
        created_at: rfc3339(u.created_at),
        updated_at: rfc3339(u.updated_at),
    }
}

fn task_dto(t: &crate::storage::models::Task) -> api::TaskDto {
    api::TaskDto {
        id: t.id,
        title: t.title.clone(),
        description: t.description.clone(),
        estimated_minutes: t.estimated_minutes,
        completed: t.completed,
        completed_at: t.completed_at.map(rfc3339),
        scheduled_date: t.scheduled_date.format("%Y-%m-%d").to_string(),
        created_at: rfc3339(t.created_at),
        updated_at: rfc3339(t.updated_at),
    }
}

fn session_dto(s: &crate::storage::models::FocusSession) -> api::FocusSessionDto {
    api::FocusSessionDto {
        id: s.id,
        task_id: s.task_id,
        duration_minutes: s.duration_minutes,
        started_at: rfc3339(s.started_at),
        ended_at: s.ended_at.map(rfc3339),
        completed: s.completed,
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl AppError {
    fn bad_request<T: Into<String>>(msg: T) -> Self {
        Self::BadRequest(msg.into())
    }
    fn unauthorized() -> Self {
        Self::Unauthorized
    }
    fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(m) => AppError::NotFound(m),
            StorageError::Conflict(m) => AppError::Conflict(m),
            other => AppError::internal(other),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, kind, detail) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m, "bad_request", None),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized".into(),
                "unauthorized",
                None,
            ),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m, "not_found", None),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m, "conflict", None),
            // Do not leak internal error details to clients, but log them
            AppError::Internal(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".into(),
                "internal",
                Some(m),
            ),
        };
        // Log any error responses at ERROR level for troubleshooting
        if let Some(detail) = detail {
            tracing::error!(status = %status, kind = kind, message = %msg, detail = %detail, "request failed");
        } else {
            tracing::error!(status = %status, kind = kind, message = %msg, "request failed");
        }
        let body = axum::Json(ErrorBody { error: msg });
        (status, body).into_response()
    }
}
