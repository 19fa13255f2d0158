use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, rejection::PathRejection, Path, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, ORIGIN},
        Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    auth::{self, AdminUser, AuthUser},
    config::{Config, DEFAULT_JWT_SECRET},
    db::{self, Store},
    error::ApiError,
    migrator::Migrator,
    models::{Provider, ProviderDraft, ProviderModel, PublicProvider, User, UserResponse},
    proxy, seed,
    state::{AppState, SharedState},
};

const MIN_PASSWORD_LEN: usize = 6;

/**
 * \brief 启动服务：连接数据库、执行迁移、初始化管理员，然后开始监听。
 * \details 任一步骤失败都会返回错误，调用方应直接退出进程。
 */
pub async fn run(config: Config) -> Result<()> {
    let state = tokio::task::spawn_blocking(move || bootstrap(config))
        .await
        .context("bootstrap task panicked")??;
    serve(state).await
}

/**
 * \brief 启动前的同步阶段：连接 → 迁移 → 管理员初始化。
 */
pub fn bootstrap(config: Config) -> Result<SharedState> {
    if config.auth.jwt_secret == DEFAULT_JWT_SECRET {
        warn!("JWT secret is the built-in default, set JWT_SECRET in production");
    }

    let store = Arc::new(Store::connect(&config.database)?);
    let state = Arc::new(AppState::new(config, store));
    {
        let conn = state.store.conn()?;
        let report = Migrator::new(&state.config.database.migrations_dir)
            .run(&conn)
            .context("failed to run migrations")?;
        info!(
            "migrations: {} applied, {} already up to date",
            report.applied.len(),
            report.skipped.len()
        );
        seed::ensure_default_admin(
            &conn,
            state.hasher.as_ref(),
            state.config.seed.repair_policy,
        )
        .context("failed to seed default admin")?;
    }
    Ok(state)
}

/**
 * \brief 在已完成初始化的状态上监听并处理请求。
 */
pub async fn serve(state: SharedState) -> Result<()> {
    let addr = state.config.server.addr.clone();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([ORIGIN, CONTENT_TYPE, AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(current_user))
        .route("/api/auth/change-password", post(change_password))
        .route("/api/config/providers", get(public_providers))
        .route("/api/proxy/v1/chat/completions", post(proxy_chat_completion))
        .route("/api/proxy/v1/images/generations", post(proxy_image_generation))
        .route(
            "/api/admin/providers",
            get(admin_list_providers).post(admin_create_provider),
        )
        .route(
            "/api/admin/providers/{id}",
            put(admin_update_provider).delete(admin_delete_provider),
        )
        .route("/api/admin/users", get(admin_list_users))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[derive(Deserialize, Debug)]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    #[serde(default)]
    old_password: String,
    #[serde(default)]
    new_password: String,
}

#[derive(Serialize, Debug)]
struct AuthResponse {
    token: String,
    user: UserResponse,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CreateProviderRequest {
    #[serde(default)]
    provider_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    api_style: String,
    #[serde(default)]
    api_host: String,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    allow_custom_key: bool,
    #[serde(default)]
    models: Vec<ProviderModel>,
    #[serde(default)]
    is_default: bool,
    #[serde(default)]
    sort_order: i64,
}

/**
 * \brief 部分更新：空字符串与缺省字段保持原值。
 */
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateProviderRequest {
    #[serde(default)]
    provider_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    api_style: String,
    #[serde(default)]
    api_host: String,
    #[serde(default)]
    api_key: String,
    enabled: Option<bool>,
    allow_custom_key: Option<bool>,
    models: Option<Vec<ProviderModel>>,
    is_default: Option<bool>,
    sort_order: Option<i64>,
}

impl UpdateProviderRequest {
    fn apply(self, draft: &mut ProviderDraft) {
        fn keep_or(target: &mut String, value: String) {
            if !value.is_empty() {
                *target = value;
            }
        }
        keep_or(&mut draft.provider_id, self.provider_id);
        keep_or(&mut draft.name, self.name);
        keep_or(&mut draft.api_style, self.api_style);
        keep_or(&mut draft.api_host, self.api_host);
        keep_or(&mut draft.api_key, self.api_key);
        if let Some(v) = self.enabled {
            draft.enabled = v;
        }
        if let Some(v) = self.allow_custom_key {
            draft.allow_custom_key = v;
        }
        if let Some(v) = self.models {
            draft.models = v;
        }
        if let Some(v) = self.is_default {
            draft.is_default = v;
        }
        if let Some(v) = self.sort_order {
            draft.sort_order = v;
        }
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request: {}", e.body_text())))
}

fn path_id(id: Result<Path<i64>, PathRejection>) -> Result<i64, ApiError> {
    id.map(|Path(v)| v)
        .map_err(|_| ApiError::BadRequest("Invalid provider ID".into()))
}

async fn hash_blocking(state: &SharedState, plaintext: String) -> Result<String, ApiError> {
    let hasher = state.hasher.clone();
    tokio::task::spawn_blocking(move || hasher.hash(&plaintext))
        .await
        .map_err(ApiError::internal("Failed to hash password"))?
        .map_err(ApiError::internal("Failed to hash password"))
}

/**
 * \brief 校验失败（含哈希损坏）一律视为不匹配。
 */
async fn verify_blocking(state: &SharedState, plaintext: String, hash: String) -> bool {
    let hasher = state.hasher.clone();
    tokio::task::spawn_blocking(move || hasher.verify(&plaintext, &hash))
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or(false)
}

fn auth_response(state: &SharedState, user: &User) -> Result<Json<AuthResponse>, ApiError> {
    let token = auth::issue_token(&state.config.auth, user)
        .map_err(ApiError::internal("Failed to generate token"))?;
    Ok(Json(AuthResponse {
        token,
        user: user.to_response(),
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/**
 * \brief 用户登录，返回令牌与用户信息。
 */
async fn login(
    State(state): State<SharedState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    let req = json_body(payload)?;
    if req.username.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "Invalid request: username and password are required".into(),
        ));
    }
    let invalid = || ApiError::Unauthorized("Invalid username or password".into());

    let user = {
        let conn = state
            .store
            .conn()
            .map_err(ApiError::internal("Failed to load user"))?;
        db::get_user_by_username(&conn, &req.username)
            .map_err(ApiError::internal("Failed to load user"))?
    }
    .ok_or_else(invalid)?;

    if !verify_blocking(&state, req.password, user.password_hash.clone()).await {
        return Err(invalid());
    }
    info!("user '{}' logged in", user.username);
    auth_response(&state, &user)
}

async fn current_user(AuthUser(user): AuthUser) -> Json<UserResponse> {
    Json(user.to_response())
}

/**
 * \brief 修改当前用户密码，成功后签发新令牌。
 */
async fn change_password(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    let req = json_body(payload)?;
    if req.old_password.is_empty() {
        return Err(ApiError::BadRequest(
            "Invalid request: oldPassword is required".into(),
        ));
    }
    if req.new_password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "Invalid request: newPassword must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    if !verify_blocking(&state, req.old_password, user.password_hash.clone()).await {
        return Err(ApiError::Unauthorized("Old password is incorrect".into()));
    }

    let hash = hash_blocking(&state, req.new_password).await?;
    let updated = {
        let conn = state
            .store
            .conn()
            .map_err(ApiError::internal("Failed to update password"))?;
        db::update_password(&conn, user.id, &hash)
            .map_err(ApiError::internal("Failed to update password"))?;
        db::get_user_by_id(&conn, user.id)
            .map_err(ApiError::internal("Failed to get updated user"))?
            .ok_or_else(|| ApiError::Internal("Failed to get updated user".into()))?
    };
    info!("user '{}' changed password", updated.username);
    auth_response(&state, &updated)
}

/**
 * \brief 普通用户可见的 Provider 列表（隐藏密钥）。
 */
async fn public_providers(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state
        .store
        .conn()
        .map_err(ApiError::internal("Failed to get providers"))?;
    let providers: Vec<PublicProvider> = db::list_enabled_providers(&conn)
        .map_err(ApiError::internal("Failed to get providers"))?
        .iter()
        .map(Provider::to_public)
        .collect();
    Ok(Json(json!({ "providers": providers })))
}

async fn proxy_chat_completion(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let provider = {
        let conn = state
            .store
            .conn()
            .map_err(ApiError::internal("Failed to get provider configuration"))?;
        proxy::resolve_upstream(&conn)?
    };
    proxy::forward(
        &state.http,
        &provider,
        &state.config.server.default_upstream,
        proxy::CHAT_COMPLETIONS_PATH,
        body,
    )
    .await
}

async fn proxy_image_generation(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let provider = {
        let conn = state
            .store
            .conn()
            .map_err(ApiError::internal("Failed to get provider configuration"))?;
        proxy::resolve_upstream(&conn)?
    };

    let mut request: serde_json::Value = serde_json::from_slice(&body)
        .ok()
        .filter(serde_json::Value::is_object)
        .ok_or_else(|| ApiError::BadRequest("Invalid request body".into()))?;
    proxy::normalize_image_prompt(&mut request);
    let converted = serde_json::to_vec(&request)
        .map_err(ApiError::internal("Failed to process request"))?;

    proxy::forward(
        &state.http,
        &provider,
        &state.config.server.default_upstream,
        proxy::IMAGE_GENERATIONS_PATH,
        Bytes::from(converted),
    )
    .await
}

async fn admin_list_providers(
    _admin: AdminUser,
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state
        .store
        .conn()
        .map_err(ApiError::internal("Failed to get providers"))?;
    let providers = db::list_providers(&conn).map_err(ApiError::internal("Failed to get providers"))?;
    Ok(Json(json!({ "providers": providers })))
}

async fn admin_create_provider(
    AdminUser(admin): AdminUser,
    State(state): State<SharedState>,
    payload: Result<Json<CreateProviderRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let req = json_body(payload)?;
    if req.provider_id.is_empty() || req.name.is_empty() || req.api_style.is_empty() {
        return Err(ApiError::BadRequest(
            "Invalid request: providerId, name and apiStyle are required".into(),
        ));
    }
    let draft = ProviderDraft {
        provider_id: req.provider_id,
        name: req.name,
        api_style: req.api_style,
        api_host: req.api_host,
        api_key: req.api_key,
        enabled: req.enabled,
        allow_custom_key: req.allow_custom_key,
        models: req.models,
        is_default: req.is_default,
        sort_order: req.sort_order,
    };

    let conn = state
        .store
        .conn()
        .map_err(ApiError::internal("Failed to create provider"))?;
    let id = db::insert_provider(&conn, &draft)
        .map_err(|e| ApiError::Internal(format!("Failed to create provider: {}", e)))?;
    let created = db::get_provider_by_id(&conn, id)
        .map_err(ApiError::internal("Failed to create provider"))?
        .ok_or_else(|| ApiError::Internal("Failed to create provider".into()))?;
    info!(
        "admin '{}' created provider id={} ({})",
        admin.username, id, created.provider_id
    );
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn admin_update_provider(
    AdminUser(admin): AdminUser,
    State(state): State<SharedState>,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<UpdateProviderRequest>, JsonRejection>,
) -> Result<Json<Provider>, ApiError> {
    let id = path_id(id)?;
    let conn = state
        .store
        .conn()
        .map_err(ApiError::internal("Failed to update provider"))?;
    let existing = db::get_provider_by_id(&conn, id)
        .map_err(ApiError::internal("Failed to update provider"))?
        .ok_or_else(|| ApiError::NotFound("Provider not found".into()))?;
    let req = json_body(payload)?;

    let mut draft = ProviderDraft::from(existing);
    req.apply(&mut draft);
    db::update_provider(&conn, id, &draft).map_err(ApiError::internal("Failed to update provider"))?;
    let updated = db::get_provider_by_id(&conn, id)
        .map_err(ApiError::internal("Failed to update provider"))?
        .ok_or_else(|| ApiError::NotFound("Provider not found".into()))?;
    info!("admin '{}' updated provider id={}", admin.username, id);
    Ok(Json(updated))
}

async fn admin_delete_provider(
    AdminUser(admin): AdminUser,
    State(state): State<SharedState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = path_id(id)?;
    let conn = state
        .store
        .conn()
        .map_err(ApiError::internal("Failed to delete provider"))?;
    if db::get_provider_by_id(&conn, id)
        .map_err(ApiError::internal("Failed to delete provider"))?
        .is_none()
    {
        return Err(ApiError::NotFound("Provider not found".into()));
    }
    db::delete_provider(&conn, id).map_err(ApiError::internal("Failed to delete provider"))?;
    info!("admin '{}' deleted provider id={}", admin.username, id);
    Ok(Json(json!({ "message": "Provider deleted" })))
}

async fn admin_list_users(
    _admin: AdminUser,
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state
        .store
        .conn()
        .map_err(ApiError::internal("Failed to get users"))?;
    let users: Vec<UserResponse> = db::list_users(&conn)
        .map_err(ApiError::internal("Failed to get users"))?
        .iter()
        .map(User::to_response)
        .collect();
    Ok(Json(json!({ "users": users })))
}
