use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    config::AuthConfig,
    db,
    error::ApiError,
    models::User,
    state::SharedState,
};

/**
 * \brief JWT 载荷。
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub user_id: i64,
    pub username: String,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

/**
 * \brief 为用户签发 HS256 令牌。
 */
pub fn issue_token(cfg: &AuthConfig, user: &User) -> jsonwebtoken::errors::Result<String> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let claims = Claims {
        user_id: user.id,
        username: user.username.clone(),
        role: user.role.clone(),
        exp: now + cfg.token_ttl.as_secs() as i64,
        iat: now,
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
    )
}

/**
 * \brief 校验签名与过期时间，返回载荷。
 */
pub fn validate_token(cfg: &AuthConfig, token: &str) -> jsonwebtoken::errors::Result<Claims> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

/**
 * \brief 从 `Authorization: Bearer <token>` 中取出令牌。
 */
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("Authorization header required".into()))?;
    match value.split_once(' ') {
        Some(("Bearer", token)) if !token.is_empty() => Ok(token),
        _ => Err(ApiError::Unauthorized(
            "Invalid authorization header format".into(),
        )),
    }
}

/**
 * \brief 已登录用户；令牌校验通过后从库中重新加载。
 */
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        let claims = validate_token(&state.config.auth, token)
            .map_err(|_| ApiError::Unauthorized("Invalid or expired token".into()))?;
        let conn = state
            .store
            .conn()
            .map_err(ApiError::internal("Failed to load user"))?;
        let user = db::get_user_by_id(&conn, claims.user_id)
            .map_err(ApiError::internal("Failed to load user"))?
            .ok_or_else(|| ApiError::Unauthorized("User not found".into()))?;
        Ok(AuthUser(user))
    }
}

/**
 * \brief 角色为 admin 的已登录用户。
 */
#[derive(Debug, Clone)]
pub struct AdminUser(pub User);

impl FromRequestParts<SharedState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ApiError::Forbidden("Admin access required".into()));
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::time::Duration;

    fn user() -> User {
        User {
            id: 7,
            username: "alice".into(),
            password_hash: String::new(),
            role: "user".into(),
            password_changed: false,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_issue_and_validate() {
        let cfg = AuthConfig::default();
        let token = issue_token(&cfg, &user()).unwrap();
        let claims = validate_token(&cfg, &token).unwrap();
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.role, "user");
        assert_eq!(claims.exp - claims.iat, 7 * 24 * 3600);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let cfg = AuthConfig::default();
        let token = issue_token(&cfg, &user()).unwrap();
        let other = AuthConfig {
            jwt_secret: "another-secret".into(),
            ..AuthConfig::default()
        };
        assert!(validate_token(&other, &token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let cfg = AuthConfig {
            token_ttl: Duration::from_secs(0),
            ..AuthConfig::default()
        };
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            user_id: 1,
            username: "alice".into(),
            role: "user".into(),
            exp: now - 3600,
            iat: now - 7200,
        };
        let token = jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        )
        .unwrap();
        assert!(validate_token(&cfg, &token).is_err());
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            bearer_token(&headers).unwrap_err().to_string(),
            "Authorization header required"
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Token abc"));
        assert_eq!(
            bearer_token(&headers).unwrap_err().to_string(),
            "Invalid authorization header format"
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def");
    }
}
