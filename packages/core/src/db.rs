use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::{
    sync::{Mutex, MutexGuard},
    thread,
    time::Duration,
};
use tracing::{info, warn};

use crate::{
    config::DatabaseConfig,
    models::{Provider, ProviderDraft, ProviderModel, User},
};

/**
 * \brief 数据库句柄，显式构造后注入迁移器、初始化器与请求处理器。
 */
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /**
     * \brief 打开数据库文件，失败时按固定次数与固定间隔重试。
     * \details 仅用于首次连接；之后的查询不做超时或重试（写入锁冲突除外）。
     */
    pub fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let attempts = cfg.connect_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match open_and_ping(cfg) {
                Ok(conn) => {
                    info!("database connected: {}", cfg.path.display());
                    return Ok(Self::from_connection(conn));
                }
                Err(e) => {
                    warn!(
                        "failed to connect database (attempt {}/{}): {:#}, retrying...",
                        attempt, attempts, e
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        thread::sleep(cfg.connect_backoff);
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow!("no connection attempt made"))
            .context("failed to connect to database after retries"))
    }

    /**
     * \brief 内存数据库，供测试使用。
     */
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /**
     * \brief 获取底层连接；临界区应尽量短。
     */
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }
}

fn open_and_ping(cfg: &DatabaseConfig) -> Result<Connection> {
    let conn = Connection::open(&cfg.path)
        .with_context(|| format!("open {}", cfg.path.display()))?;
    conn.busy_timeout(cfg.busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .context("ping database")?;
    Ok(conn)
}

const USER_COLUMNS: &str = "id, username, password_hash, role, password_changed, created_at";

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        role: row.get(3)?,
        password_changed: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

/**
 * \brief 按 ID 获取用户。
 */
pub fn get_user_by_id(conn: &Connection, id: i64) -> Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id=?1", USER_COLUMNS),
        params![id],
        map_user,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 按用户名获取用户。
 */
pub fn get_user_by_username(conn: &Connection, username: &str) -> Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE username=?1", USER_COLUMNS),
        params![username],
        map_user,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出全部用户（按创建时间倒序）。
 */
pub fn list_users(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users ORDER BY created_at DESC, id DESC",
        USER_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], map_user)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_users(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
}

/**
 * \brief 新增用户。
 */
pub fn insert_user(
    conn: &Connection,
    username: &str,
    password_hash: &str,
    role: &str,
    password_changed: bool,
) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO users (username, password_hash, role, password_changed) VALUES (?1, ?2, ?3, ?4)",
            params![username, password_hash, role, password_changed as i64],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 用户主动修改密码，同时标记 password_changed。
 */
pub fn update_password(conn: &Connection, user_id: i64, password_hash: &str) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE users SET password_hash=?1, password_changed=1 WHERE id=?2",
            params![password_hash, user_id],
        )
    })?;
    if rows == 0 {
        bail!("user id {} not found", user_id);
    }
    Ok(())
}

/**
 * \brief 按用户名重置密码并清除 password_changed，返回受影响行数。
 */
pub fn reset_password(conn: &Connection, username: &str, password_hash: &str) -> Result<usize> {
    retry_on_locked(|| {
        conn.execute(
            "UPDATE users SET password_hash=?1, password_changed=0 WHERE username=?2",
            params![password_hash, username],
        )
    })
}

const PROVIDER_COLUMNS: &str = "id, provider_id, name, api_style, api_host, api_key, enabled, \
     allow_custom_key, models, is_default, sort_order, created_at, updated_at";

fn map_provider(row: &Row<'_>) -> rusqlite::Result<Provider> {
    let models_json: Option<String> = row.get(8)?;
    Ok(Provider {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        name: row.get(2)?,
        api_style: row.get(3)?,
        api_host: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        api_key: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        enabled: row.get::<_, i64>(6)? != 0,
        allow_custom_key: row.get::<_, i64>(7)? != 0,
        models: decode_models(models_json.as_deref()),
        is_default: row.get::<_, i64>(9)? != 0,
        sort_order: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn decode_models(raw: Option<&str>) -> Vec<ProviderModel> {
    match raw {
        Some(s) if !s.trim().is_empty() => serde_json::from_str(s).unwrap_or_else(|e| {
            warn!("ignoring malformed provider models column: {}", e);
            Vec::new()
        }),
        _ => Vec::new(),
    }
}

/**
 * \brief 新增 Provider，返回新主键。
 */
pub fn insert_provider(conn: &Connection, draft: &ProviderDraft) -> Result<i64> {
    let models = serde_json::to_string(&draft.models)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO system_providers
             (provider_id, name, api_style, api_host, api_key, enabled, allow_custom_key, models, is_default, sort_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                draft.provider_id,
                draft.name,
                draft.api_style,
                draft.api_host,
                draft.api_key,
                draft.enabled as i64,
                draft.allow_custom_key as i64,
                models,
                draft.is_default as i64,
                draft.sort_order
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 全量覆盖更新 Provider。
 */
pub fn update_provider(conn: &Connection, id: i64, draft: &ProviderDraft) -> Result<()> {
    let models = serde_json::to_string(&draft.models)?;
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE system_providers SET
                provider_id=?1, name=?2, api_style=?3, api_host=?4, api_key=?5,
                enabled=?6, allow_custom_key=?7, models=?8, is_default=?9, sort_order=?10,
                updated_at=CURRENT_TIMESTAMP
             WHERE id=?11",
            params![
                draft.provider_id,
                draft.name,
                draft.api_style,
                draft.api_host,
                draft.api_key,
                draft.enabled as i64,
                draft.allow_custom_key as i64,
                models,
                draft.is_default as i64,
                draft.sort_order,
                id
            ],
        )
    })?;
    if rows == 0 {
        bail!("provider id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 删除 Provider，返回是否确实删除了记录。
 */
pub fn delete_provider(conn: &Connection, id: i64) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute("DELETE FROM system_providers WHERE id=?1", params![id])
    })?;
    Ok(rows > 0)
}

/**
 * \brief 按 ID 获取 Provider。
 */
pub fn get_provider_by_id(conn: &Connection, id: i64) -> Result<Option<Provider>> {
    conn.query_row(
        &format!("SELECT {} FROM system_providers WHERE id=?1", PROVIDER_COLUMNS),
        params![id],
        map_provider,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出全部 Provider（管理员）。
 */
pub fn list_providers(conn: &Connection) -> Result<Vec<Provider>> {
    query_providers(
        conn,
        &format!(
            "SELECT {} FROM system_providers ORDER BY sort_order ASC, id ASC",
            PROVIDER_COLUMNS
        ),
    )
}

/**
 * \brief 列出已启用的 Provider（普通用户）。
 */
pub fn list_enabled_providers(conn: &Connection) -> Result<Vec<Provider>> {
    query_providers(
        conn,
        &format!(
            "SELECT {} FROM system_providers WHERE enabled=1 ORDER BY sort_order ASC, id ASC",
            PROVIDER_COLUMNS
        ),
    )
}

/**
 * \brief 查找已启用且业务标识匹配的第一个 Provider。
 */
pub fn find_enabled_provider(conn: &Connection, provider_id: &str) -> Result<Option<Provider>> {
    Ok(list_enabled_providers(conn)?
        .into_iter()
        .find(|p| p.provider_id == provider_id))
}

fn query_providers(conn: &Connection, sql: &str) -> Result<Vec<Provider>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], map_provider)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
pub(crate) fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;

    /**
     * \brief 使用仓库自带迁移初始化内存库。
     */
    pub(crate) fn migrated_store() -> Store {
        let store = Store::in_memory().expect("open in-memory db");
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
        {
            let conn = store.conn().expect("lock");
            crate::migrator::Migrator::new(dir)
                .run(&conn)
                .expect("migrate");
        }
        store
    }

    fn draft(provider_id: &str, enabled: bool, sort_order: i64) -> ProviderDraft {
        ProviderDraft {
            provider_id: provider_id.to_string(),
            name: provider_id.to_uppercase(),
            api_style: "openai".into(),
            api_host: "https://api.example.com".into(),
            api_key: "sk-1".into(),
            enabled,
            allow_custom_key: false,
            models: vec![ProviderModel {
                model_id: "gpt-4o".into(),
                ..Default::default()
            }],
            is_default: false,
            sort_order,
        }
    }

    #[test]
    fn test_provider_crud() {
        let store = migrated_store();
        let conn = store.conn().unwrap();
        let before = list_providers(&conn).unwrap().len();

        let id = insert_provider(&conn, &draft("p1", true, 5)).expect("insert");
        let got = get_provider_by_id(&conn, id).unwrap().expect("exists");
        assert_eq!(got.provider_id, "p1");
        assert_eq!(got.models.len(), 1);
        assert!(got.enabled);

        let mut changed = ProviderDraft::from(got);
        changed.name = "renamed".into();
        changed.enabled = false;
        update_provider(&conn, id, &changed).expect("update");
        let got = get_provider_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(got.name, "renamed");
        assert!(!got.enabled);

        assert_eq!(list_providers(&conn).unwrap().len(), before + 1);
        assert!(delete_provider(&conn, id).unwrap());
        assert!(!delete_provider(&conn, id).unwrap());
        assert!(get_provider_by_id(&conn, id).unwrap().is_none());
    }

    #[test]
    fn test_update_missing_provider_fails() {
        let store = migrated_store();
        let conn = store.conn().unwrap();
        assert!(update_provider(&conn, 9999, &draft("x", true, 0)).is_err());
    }

    #[test]
    fn test_enabled_providers_are_filtered_and_ordered() {
        let store = migrated_store();
        let conn = store.conn().unwrap();
        conn.execute("DELETE FROM system_providers", []).unwrap();
        insert_provider(&conn, &draft("b", true, 2)).unwrap();
        insert_provider(&conn, &draft("a", true, 1)).unwrap();
        insert_provider(&conn, &draft("off", false, 0)).unwrap();

        let enabled = list_enabled_providers(&conn).unwrap();
        let ids: Vec<_> = enabled.iter().map(|p| p.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(find_enabled_provider(&conn, "off").unwrap().is_none());
        assert!(find_enabled_provider(&conn, "b").unwrap().is_some());
    }

    #[test]
    fn test_user_password_updates() {
        let store = migrated_store();
        let conn = store.conn().unwrap();
        let id = insert_user(&conn, "alice", "h1", "user", false).unwrap();

        update_password(&conn, id, "h2").unwrap();
        let user = get_user_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(user.password_hash, "h2");
        assert!(user.password_changed);

        assert_eq!(reset_password(&conn, "alice", "h3").unwrap(), 1);
        let user = get_user_by_username(&conn, "alice").unwrap().unwrap();
        assert_eq!(user.password_hash, "h3");
        assert!(!user.password_changed);

        assert_eq!(reset_password(&conn, "nobody", "h4").unwrap(), 0);
        assert!(update_password(&conn, 9999, "h").is_err());
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let store = migrated_store();
        let conn = store.conn().unwrap();
        insert_user(&conn, "bob", "h", "user", false).unwrap();
        assert!(insert_user(&conn, "bob", "h", "user", false).is_err());
        assert_eq!(count_users(&conn).unwrap(), 1);
        assert_eq!(list_users(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_connect_gives_up_after_attempts() {
        let cfg = DatabaseConfig {
            path: Path::new("/nonexistent-dir/for/sure/chatbox.db").to_path_buf(),
            connect_attempts: 2,
            connect_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        assert!(Store::connect(&cfg).is_err());
    }

    #[test]
    fn test_connect_opens_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DatabaseConfig {
            path: dir.path().join("test.db"),
            connect_attempts: 1,
            ..Default::default()
        };
        let store = Store::connect(&cfg).expect("connect");
        let one: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(one, 1);
    }
}
