use std::{path::PathBuf, time::Duration};

use crate::seed::RepairPolicy;

pub const DEFAULT_JWT_SECRET: &str = "change-me-in-production";

/**
 * \brief 进程级配置，由 CLI 从参数与环境变量组装。
 */
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub seed: SeedConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /** \brief 监听地址，如 "0.0.0.0:8080" */
    pub addr: String,
    /** \brief 未配置 api_host 时代理使用的上游地址 */
    pub default_upstream: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            default_upstream: "https://api.openai.com".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub migrations_dir: PathBuf,
    /** \brief 启动时连接的最大尝试次数 */
    pub connect_attempts: u32,
    /** \brief 两次连接尝试之间的等待 */
    pub connect_backoff: Duration,
    pub busy_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("chatbox.db"),
            migrations_dir: PathBuf::from("migrations"),
            connect_attempts: 30,
            connect_backoff: Duration::from_secs(2),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            token_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeedConfig {
    pub repair_policy: RepairPolicy,
}
