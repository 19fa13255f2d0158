//! Versioned SQL migrations.
//!
//! Units are files named `<version>_<description>.sql` in a single directory.
//! Each unit is applied at most once; its MD5 checksum is recorded in
//! `schema_migrations` and re-verified on every run, so editing a shipped
//! migration after it has been applied stops the process at startup.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{debug, info, warn};

const RECORD_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    filename TEXT NOT NULL,
    checksum TEXT NOT NULL,
    executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

const COMMENT_MARKER: &str = "--";
const TERMINATOR: char = ';';

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to read migrations directory {}: {source}", dir.display())]
    Discovery { dir: PathBuf, source: io::Error },

    #[error("failed to read migration file {filename}: {source}")]
    Read { filename: String, source: io::Error },

    #[error("duplicate migration version {version}: {first} and {second}")]
    DuplicateVersion {
        version: u32,
        first: String,
        second: String,
    },

    #[error("migration {filename} has been modified after execution (checksum mismatch: recorded {recorded}, found {found})")]
    ChecksumMismatch {
        filename: String,
        recorded: String,
        found: String,
    },

    #[error("failed to execute migration {filename}: SQL `{statement}`: {source}")]
    Execution {
        filename: String,
        statement: String,
        source: rusqlite::Error,
    },

    #[error("migration {filename} executed but recording it failed, schema is ahead of schema_migrations: {source}")]
    Record {
        filename: String,
        source: rusqlite::Error,
    },

    #[error("failed to access schema_migrations: {0}")]
    Bookkeeping(#[from] rusqlite::Error),
}

/**
 * \brief 启动时从目录发现的迁移单元，只在一次运行内存在。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    pub version: u32,
    pub filename: String,
    pub content: String,
    pub checksum: String,
}

/**
 * \brief schema_migrations 中的一行。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub version: u32,
    pub filename: String,
    pub checksum: String,
    pub executed_at: Option<String>,
}

/**
 * \brief 单次运行的结果：本次执行的版本与已执行而跳过的版本。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<u32>,
    pub skipped: Vec<u32>,
}

/**
 * \brief 迁移单元的当前状态，用于 `migrate --status`。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: u32,
    pub filename: String,
    pub executed_at: Option<String>,
    pub applied: bool,
}

#[derive(Debug, Clone)]
pub struct Migrator {
    dir: PathBuf,
}

impl Migrator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /**
     * \brief 执行全部未执行的迁移。
     * \details 先校验所有已执行迁移的 checksum，任一不符即中止且不再写入；
     * 之后按版本升序逐条执行。某个单元失败时，之前的单元保持已执行，
     * 失败的单元不会被记录，下次启动会重新尝试。
     */
    pub fn run(&self, conn: &Connection) -> Result<MigrationReport, MigrationError> {
        ensure_record_table(conn)?;
        let units = self.discover()?;
        let executed = load_applied(conn)?;

        verify_checksums(&units, &executed)?;
        for version in executed.keys() {
            if !units.iter().any(|u| u.version == *version) {
                warn!(
                    "migration version {} is recorded but its file is missing from {}",
                    version,
                    self.dir.display()
                );
            }
        }

        let mut report = MigrationReport::default();
        for unit in &units {
            if executed.contains_key(&unit.version) {
                debug!("migration {} already executed, skipping", unit.filename);
                report.skipped.push(unit.version);
                continue;
            }
            info!("running migration: {}", unit.filename);
            apply_unit(conn, unit)?;
            info!("migration {} completed", unit.filename);
            report.applied.push(unit.version);
        }

        if report.applied.is_empty() {
            info!("database schema is up to date ({} migrations)", units.len());
        }
        Ok(report)
    }

    /**
     * \brief 读取目录下的全部迁移单元，按版本升序返回。
     * \details 文件名不合规的单元记录警告后跳过；版本号重复视为配置错误。
     */
    pub fn discover(&self) -> Result<Vec<MigrationUnit>, MigrationError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| MigrationError::Discovery {
            dir: self.dir.clone(),
            source,
        })?;

        let mut units = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| MigrationError::Discovery {
                dir: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            let Some(version) = parse_version(&filename) else {
                warn!("skipping invalid migration filename: {}", filename);
                continue;
            };
            let content = fs::read_to_string(&path).map_err(|source| MigrationError::Read {
                filename: filename.clone(),
                source,
            })?;
            units.push(MigrationUnit {
                version,
                checksum: checksum(content.as_bytes()),
                filename,
                content,
            });
        }

        units.sort_by(|a, b| a.version.cmp(&b.version).then(a.filename.cmp(&b.filename)));
        if let Some(pair) = units.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(MigrationError::DuplicateVersion {
                version: pair[0].version,
                first: pair[0].filename.clone(),
                second: pair[1].filename.clone(),
            });
        }
        Ok(units)
    }

    /**
     * \brief 列出每个迁移单元是否已执行。
     */
    pub fn status(&self, conn: &Connection) -> Result<Vec<MigrationStatus>, MigrationError> {
        ensure_record_table(conn)?;
        let records: BTreeMap<u32, MigrationRecord> = list_records(conn)?
            .into_iter()
            .map(|r| (r.version, r))
            .collect();
        Ok(self
            .discover()?
            .into_iter()
            .map(|unit| {
                let record = records.get(&unit.version);
                MigrationStatus {
                    version: unit.version,
                    filename: unit.filename,
                    executed_at: record.and_then(|r| r.executed_at.clone()),
                    applied: record.is_some(),
                }
            })
            .collect())
    }
}

/**
 * \brief 按行切分 SQL 语句。
 * \details 以 `--` 开头的行整体忽略；其余行累积到缓冲区，
 * 行尾（去空白后）为 `;` 时输出一条语句。末尾没有分号的剩余内容作为最后一条。
 * 这是按行的启发式切分，字符串字面量中的 `;` 同样会被当作语句结束。
 */
pub fn split_statements(content: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with(COMMENT_MARKER) {
            continue;
        }
        current.push_str(line);
        current.push('\n');
        if trimmed.ends_with(TERMINATOR) {
            statements.push(std::mem::take(&mut current));
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        statements.push(rest.to_string());
    }
    statements
}

/**
 * \brief 迁移内容的 MD5 十六进制摘要，仅用于发现意外修改。
 */
pub fn checksum(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

/**
 * \brief 从 `<version>_<description>.sql` 中解析版本号；版本必须为正整数。
 */
fn parse_version(filename: &str) -> Option<u32> {
    let (prefix, _) = filename.split_once('_')?;
    match prefix.parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(v) => Some(v),
    }
}

fn ensure_record_table(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch(RECORD_TABLE_DDL)?;
    Ok(())
}

fn load_applied(conn: &Connection) -> Result<BTreeMap<u32, String>, MigrationError> {
    let mut stmt = conn.prepare("SELECT version, checksum FROM schema_migrations")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

/**
 * \brief 读取全部迁移记录（按版本升序）。
 */
pub fn list_records(conn: &Connection) -> Result<Vec<MigrationRecord>, MigrationError> {
    let mut stmt = conn.prepare(
        "SELECT version, filename, checksum, executed_at FROM schema_migrations ORDER BY version ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(MigrationRecord {
                version: row.get(0)?,
                filename: row.get(1)?,
                checksum: row.get(2)?,
                executed_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn verify_checksums(
    units: &[MigrationUnit],
    executed: &BTreeMap<u32, String>,
) -> Result<(), MigrationError> {
    for unit in units {
        if let Some(recorded) = executed.get(&unit.version) {
            if *recorded != unit.checksum {
                return Err(MigrationError::ChecksumMismatch {
                    filename: unit.filename.clone(),
                    recorded: recorded.clone(),
                    found: unit.checksum.clone(),
                });
            }
        }
    }
    Ok(())
}

/**
 * \brief 逐条执行单元内语句（DDL 不在事务中），全部成功后再写入记录。
 */
fn apply_unit(conn: &Connection, unit: &MigrationUnit) -> Result<(), MigrationError> {
    for statement in split_statements(&unit.content) {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        conn.execute_batch(statement)
            .map_err(|source| MigrationError::Execution {
                filename: unit.filename.clone(),
                statement: preview(statement),
                source,
            })?;
    }

    conn.execute(
        "INSERT INTO schema_migrations (version, filename, checksum) VALUES (?1, ?2, ?3)",
        params![unit.version, unit.filename, unit.checksum],
    )
    .map_err(|source| MigrationError::Record {
        filename: unit.filename.clone(),
        source,
    })?;
    Ok(())
}

fn preview(statement: &str) -> String {
    const MAX: usize = 50;
    if statement.chars().count() <= MAX {
        statement.to_string()
    } else {
        let head: String = statement.chars().take(MAX).collect();
        format!("{}...", head)
    }
}
