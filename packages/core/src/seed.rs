use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::{db, password::CredentialHasher};

pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";

/**
 * \brief 管理员已存在但哈希与默认密码不匹配时的处理方式。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepairPolicy {
    /**
     * \brief 仅当哈希串无法按当前算法解析时才重置（默认）。
     * 格式正确但不匹配默认密码的哈希视为已轮换，保持不变。
     */
    #[default]
    Malformed,
    /**
     * \brief 只要哈希不能通过默认密码校验就重置，并清除 password_changed。
     * 无法区分合法的密码轮换与损坏，每次启动都会回滚已修改的密码。
     */
    Mismatch,
}

impl std::str::FromStr for RepairPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "malformed" => Ok(RepairPolicy::Malformed),
            "mismatch" => Ok(RepairPolicy::Mismatch),
            other => Err(format!(
                "unknown repair policy '{}', expected 'malformed' or 'mismatch'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    /** \brief 管理员不存在，已创建。 */
    Created,
    /** \brief 哈希可通过默认密码校验，未做任何写入。 */
    Unchanged,
    /** \brief 哈希被判定为损坏，已重置为默认密码。 */
    Repaired,
    /** \brief 哈希格式正确但不是默认密码，视为已轮换，未写入。 */
    Rotated,
}

/**
 * \brief 确保存在用户名为 admin 的管理员，且其哈希处于可用状态。
 * \details 必须在迁移之后、HTTP 服务接收流量之前调用。
 * 新建或重置时会在日志中打印默认密码。
 */
pub fn ensure_default_admin(
    conn: &Connection,
    hasher: &dyn CredentialHasher,
    policy: RepairPolicy,
) -> Result<SeedOutcome> {
    let (count, stored_hash): (i64, String) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(MAX(password_hash), '') FROM users WHERE username=?1",
            params![DEFAULT_ADMIN_USERNAME],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .context("query admin user")?;

    if count == 0 {
        let hash = hasher
            .hash(DEFAULT_ADMIN_PASSWORD)
            .context("hash default admin password")?;
        db::insert_user(conn, DEFAULT_ADMIN_USERNAME, &hash, "admin", false)
            .context("insert default admin")?;
        warn!(
            "default admin user '{}' created with password '{}', change it after first login",
            DEFAULT_ADMIN_USERNAME, DEFAULT_ADMIN_PASSWORD
        );
        return Ok(SeedOutcome::Created);
    }

    // 可解析但参数非法的哈希同样无法校验，按损坏处理
    let well_formed = hasher.is_well_formed(&stored_hash);
    let verdict = if well_formed {
        hasher.verify(DEFAULT_ADMIN_PASSWORD, &stored_hash)
    } else {
        Ok(false)
    };
    match verdict {
        Ok(true) => {
            info!(
                "admin user '{}' already exists with the default password",
                DEFAULT_ADMIN_USERNAME
            );
            return Ok(SeedOutcome::Unchanged);
        }
        Ok(false) if well_formed && policy == RepairPolicy::Malformed => {
            info!(
                "admin user '{}' already exists with a rotated password",
                DEFAULT_ADMIN_USERNAME
            );
            return Ok(SeedOutcome::Rotated);
        }
        Ok(false) => {}
        Err(e) => warn!(
            "admin user '{}' password hash cannot be verified: {}",
            DEFAULT_ADMIN_USERNAME, e
        ),
    }

    warn!(
        "admin user '{}' exists but password hash is invalid, resetting password",
        DEFAULT_ADMIN_USERNAME
    );
    let hash = hasher
        .hash(DEFAULT_ADMIN_PASSWORD)
        .context("hash default admin password")?;
    db::reset_password(conn, DEFAULT_ADMIN_USERNAME, &hash).context("reset admin password")?;
    warn!("admin password reset to '{}'", DEFAULT_ADMIN_PASSWORD);
    Ok(SeedOutcome::Repaired)
}
