use std::sync::Arc;

use crate::{
    config::Config,
    db::Store,
    password::{Argon2Hasher, CredentialHasher},
};

/**
 * \brief 所有请求处理器共享的状态；除连接外无其他可变状态。
 */
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub hasher: Arc<dyn CredentialHasher>,
    /** \brief 上游代理复用的 HTTP 客户端 */
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, store: Arc<Store>) -> Self {
        Self {
            config,
            store,
            hasher: Arc::new(Argon2Hasher),
            http: reqwest::Client::new(),
        }
    }
}

pub type SharedState = Arc<AppState>;
