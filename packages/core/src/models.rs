use serde::{Deserialize, Serialize};

/**
 * \brief 后台用户。`password_hash` 永不序列化到响应中。
 */
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    /** \brief 角色：admin/user */
    pub role: String,
    /** \brief 是否已修改过初始密码 */
    pub password_changed: bool,
    pub created_at: String,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    pub fn to_response(&self) -> UserResponse {
        UserResponse {
            id: self.id,
            username: self.username.clone(),
            role: self.role.clone(),
            password_changed: self.password_changed,
            created_at: self.created_at.clone(),
        }
    }
}

/**
 * \brief 对外暴露的用户信息。
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub role: String,
    pub password_changed: bool,
    pub created_at: String,
}

/**
 * \brief Provider 下挂的模型描述。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderModel {
    pub model_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nickname: String,
    /** \brief chat | embedding | rerank */
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub model_type: String,
    /** \brief openai | google | anthropic */
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_style: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /** \brief vision | reasoning | tool_use | web_search */
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub context_window: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_output: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/**
 * \brief 系统级 Provider 配置（管理员维护）。
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: i64,
    /** \brief 业务标识，如 "enter-ai" */
    pub provider_id: String,
    pub name: String,
    pub api_style: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    pub enabled: bool,
    pub allow_custom_key: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ProviderModel>,
    pub is_default: bool,
    pub sort_order: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Provider {
    /**
     * \brief 转为公开格式，隐藏 API Key。
     */
    pub fn to_public(&self) -> PublicProvider {
        PublicProvider {
            id: self.id,
            provider_id: self.provider_id.clone(),
            name: self.name.clone(),
            api_style: self.api_style.clone(),
            api_host: self.api_host.clone(),
            has_system_key: !self.api_key.is_empty(),
            allow_custom_key: self.allow_custom_key,
            models: self.models.clone(),
            is_default: self.is_default,
            sort_order: self.sort_order,
        }
    }
}

/**
 * \brief 普通用户可见的 Provider 信息。
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicProvider {
    pub id: i64,
    pub provider_id: String,
    pub name: String,
    pub api_style: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_host: String,
    pub has_system_key: bool,
    pub allow_custom_key: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ProviderModel>,
    pub is_default: bool,
    pub sort_order: i64,
}

/**
 * \brief 写入 Provider 时使用的字段集合。
 */
#[derive(Debug, Clone, Default)]
pub struct ProviderDraft {
    pub provider_id: String,
    pub name: String,
    pub api_style: String,
    pub api_host: String,
    pub api_key: String,
    pub enabled: bool,
    pub allow_custom_key: bool,
    pub models: Vec<ProviderModel>,
    pub is_default: bool,
    pub sort_order: i64,
}

impl From<Provider> for ProviderDraft {
    fn from(p: Provider) -> Self {
        Self {
            provider_id: p.provider_id,
            name: p.name,
            api_style: p.api_style,
            api_host: p.api_host,
            api_key: p.api_key,
            enabled: p.enabled,
            allow_custom_key: p.allow_custom_key,
            models: p.models,
            is_default: p.is_default,
            sort_order: p.sort_order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Provider {
        Provider {
            id: 1,
            provider_id: "enter-ai".into(),
            name: "EnterAI".into(),
            api_style: "openai".into(),
            api_host: "https://api.example.com".into(),
            api_key: "sk-secret".into(),
            enabled: true,
            allow_custom_key: false,
            models: vec![ProviderModel {
                model_id: "gpt-4o".into(),
                ..Default::default()
            }],
            is_default: true,
            sort_order: 0,
            created_at: "2024-01-01 00:00:00".into(),
            updated_at: "2024-01-01 00:00:00".into(),
        }
    }

    #[test]
    fn test_public_provider_hides_key() {
        let public = sample().to_public();
        assert!(public.has_system_key);
        let json = serde_json::to_value(&public).unwrap();
        assert!(json.get("apiKey").is_none());
        assert_eq!(json["providerId"], "enter-ai");
        assert_eq!(json["hasSystemKey"], true);
    }

    #[test]
    fn test_provider_model_uses_camel_case_and_skips_empty() {
        let json = serde_json::to_value(&sample().models[0]).unwrap();
        assert_eq!(json, serde_json::json!({"modelId": "gpt-4o"}));

        let parsed: ProviderModel =
            serde_json::from_str(r#"{"modelId":"dall-e-3","type":"image","contextWindow":8}"#)
                .unwrap();
        assert_eq!(parsed.model_type, "image");
        assert_eq!(parsed.context_window, 8);
    }
}
