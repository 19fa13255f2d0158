pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod migrator;
pub mod models;
pub mod password;
pub mod proxy;
pub mod seed;
pub mod server;
pub mod state;

/**
 * \brief 预导入集合，方便 CLI 与集成测试引用常用模块。
 */
pub mod prelude {
    pub use crate::config::{self, Config};
    pub use crate::db::{self, Store};
    pub use crate::logging;
    pub use crate::migrator::Migrator;
    pub use crate::models;
    pub use crate::password::{Argon2Hasher, CredentialHasher};
    pub use crate::seed::{self, RepairPolicy};
    pub use crate::server;
}
