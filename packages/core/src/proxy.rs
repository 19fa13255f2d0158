use std::pin::Pin;

use async_stream::try_stream;
use axum::{
    body::{Body, Bytes},
    http::{
        header::{AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_TYPE},
        HeaderValue,
    },
    response::Response,
};
use futures_util::{Stream, StreamExt};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{db, error::ApiError, models::Provider};

/** \brief 代理接口使用的系统 Provider 业务标识。 */
pub const ENTER_AI_PROVIDER_ID: &str = "enter-ai";

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub const IMAGE_GENERATIONS_PATH: &str = "/v1/images/generations";

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/**
 * \brief 取出可用于代理的系统 Provider。
 * \details 未启用或不存在返回 404，未配置密钥返回 400。
 */
pub fn resolve_upstream(conn: &Connection) -> Result<Provider, ApiError> {
    let provider = db::find_enabled_provider(conn, ENTER_AI_PROVIDER_ID)
        .map_err(ApiError::internal("Failed to get provider configuration"))?
        .ok_or_else(|| ApiError::NotFound("EnterAI provider not configured".into()))?;
    if provider.api_key.is_empty() {
        return Err(ApiError::BadRequest(
            "EnterAI API key not configured".into(),
        ));
    }
    Ok(provider)
}

/**
 * \brief 拼接上游地址；api_host 为空时使用默认地址。
 */
pub fn target_url(provider: &Provider, default_host: &str, path: &str) -> String {
    let host = if provider.api_host.trim().is_empty() {
        default_host
    } else {
        provider.api_host.trim()
    };
    format!("{}{}", host.trim_end_matches('/'), path)
}

/**
 * \brief 将对象或数组形式的 prompt 归一为纯文本。
 * \details 对象取 `text` 字段；数组取第一个带 `text` 的对象或第一个字符串元素。
 */
pub fn normalize_image_prompt(body: &mut Value) {
    let Some(prompt) = body.get("prompt") else {
        return;
    };
    let text = match prompt {
        Value::Object(map) => map.get("text").and_then(Value::as_str).map(str::to_owned),
        Value::Array(items) => items.iter().find_map(|item| match item {
            Value::Object(map) => map.get("text").and_then(Value::as_str).map(str::to_owned),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }),
        _ => None,
    };
    if let Some(text) = text {
        body["prompt"] = Value::String(text);
    }
}

/**
 * \brief 将请求体原样转发至上游。
 * \details 上游返回 `text/event-stream` 时逐块透传，否则读完后连同状态码与
 * Content-Type 一并返回。
 */
pub async fn forward(
    client: &reqwest::Client,
    provider: &Provider,
    default_host: &str,
    path: &str,
    body: Bytes,
) -> Result<Response, ApiError> {
    let url = target_url(provider, default_host, path);
    debug!("proxy -> {} ({} bytes)", url, body.len());

    let resp = client
        .post(&url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", provider.api_key))
        .body(body)
        .send()
        .await
        .map_err(|e| {
            warn!("upstream request to {} failed: {}", url, e);
            ApiError::BadGateway(format!("Failed to connect to AI service: {}", e))
        })?;

    let status = resp.status();
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    let is_stream = content_type
        .to_str()
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);

    if is_stream {
        let mut upstream = resp.bytes_stream();
        let stream: ByteStream = Box::pin(try_stream! {
            while let Some(chunk) = upstream.next().await {
                let chunk = chunk.map_err(|e| {
                    warn!("upstream stream interrupted: {}", e);
                    e
                })?;
                yield chunk;
            }
        });
        return Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .header(CONNECTION, "keep-alive")
            .body(Body::from_stream(stream))
            .map_err(ApiError::internal("Failed to build stream response"));
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(ApiError::internal("Failed to read response"))?;
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(bytes))
        .map_err(ApiError::internal("Failed to build response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::migrated_store;
    use crate::models::ProviderDraft;
    use serde_json::json;

    fn provider(host: &str) -> Provider {
        Provider {
            id: 1,
            provider_id: ENTER_AI_PROVIDER_ID.into(),
            name: "EnterAI".into(),
            api_style: "openai".into(),
            api_host: host.into(),
            api_key: "sk".into(),
            enabled: true,
            allow_custom_key: false,
            models: vec![],
            is_default: true,
            sort_order: 0,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_target_url() {
        let default = "https://api.openai.com";
        assert_eq!(
            target_url(&provider(""), default, CHAT_COMPLETIONS_PATH),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            target_url(&provider("https://llm.internal/"), default, IMAGE_GENERATIONS_PATH),
            "https://llm.internal/v1/images/generations"
        );
    }

    #[test]
    fn test_normalize_prompt_object() {
        let mut body = json!({"prompt": {"text": "a cat"}, "n": 1});
        normalize_image_prompt(&mut body);
        assert_eq!(body, json!({"prompt": "a cat", "n": 1}));
    }

    #[test]
    fn test_normalize_prompt_array() {
        let mut body = json!({"prompt": [{"type": "image"}, {"type": "text", "text": "a dog"}]});
        normalize_image_prompt(&mut body);
        assert_eq!(body["prompt"], "a dog");

        let mut body = json!({"prompt": [1, "plain", "second"]});
        normalize_image_prompt(&mut body);
        assert_eq!(body["prompt"], "plain");
    }

    #[test]
    fn test_normalize_prompt_untouched() {
        let mut body = json!({"prompt": "already text"});
        normalize_image_prompt(&mut body);
        assert_eq!(body["prompt"], "already text");

        let mut body = json!({"prompt": {"other": 1}});
        normalize_image_prompt(&mut body);
        assert_eq!(body["prompt"], json!({"other": 1}));

        let mut body = json!({"size": "1024x1024"});
        normalize_image_prompt(&mut body);
        assert_eq!(body, json!({"size": "1024x1024"}));
    }

    #[test]
    fn test_resolve_upstream_states() {
        let store = migrated_store();
        let conn = store.conn().unwrap();

        // seeded row is disabled
        let err = resolve_upstream(&conn).unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        let seeded = db::list_providers(&conn)
            .unwrap()
            .into_iter()
            .find(|p| p.provider_id == ENTER_AI_PROVIDER_ID)
            .expect("seeded enter-ai");
        let mut draft = ProviderDraft::from(seeded.clone());
        draft.enabled = true;
        db::update_provider(&conn, seeded.id, &draft).unwrap();
        let err = resolve_upstream(&conn).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        draft.api_key = "sk-live".into();
        db::update_provider(&conn, seeded.id, &draft).unwrap();
        assert_eq!(resolve_upstream(&conn).unwrap().api_key, "sk-live");
    }
}
