use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use chatbox_core::prelude::*;

const MIN_PASSWORD_LEN: usize = 6;

/**
 * \brief Chatbox 后端命令行入口。
 */
#[derive(Parser, Debug)]
#[command(name = "chatbox", version, about = "Chatbox backend service")]
struct Cli {
    /** \brief 以 JSON 格式输出日志 */
    #[arg(long, global = true, env = "CHATBOX_LOG_JSON", default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct DatabaseArgs {
    /** \brief SQLite 数据库文件 */
    #[arg(long, env = "CHATBOX_DB_PATH", default_value = "chatbox.db")]
    db_path: PathBuf,
    /** \brief 迁移脚本目录 */
    #[arg(long, env = "CHATBOX_MIGRATIONS_DIR", default_value = "migrations")]
    migrations_dir: PathBuf,
    /** \brief 启动时连接数据库的最大尝试次数 */
    #[arg(long, env = "CHATBOX_DB_CONNECT_ATTEMPTS", default_value_t = 30)]
    connect_attempts: u32,
}

impl DatabaseArgs {
    fn into_config(self) -> config::DatabaseConfig {
        config::DatabaseConfig {
            path: self.db_path,
            migrations_dir: self.migrations_dir,
            connect_attempts: self.connect_attempts,
            ..config::DatabaseConfig::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 迁移数据库、初始化管理员并启动 HTTP 服务。
     */
    Serve {
        #[arg(long, env = "CHATBOX_ADDR", default_value = "0.0.0.0:8080")]
        addr: String,
        #[command(flatten)]
        database: DatabaseArgs,
        #[arg(long, env = "JWT_SECRET", default_value = config::DEFAULT_JWT_SECRET)]
        jwt_secret: String,
        /** \brief 未配置 api_host 时的上游地址 */
        #[arg(long, env = "CHATBOX_DEFAULT_UPSTREAM", default_value = "https://api.openai.com")]
        default_upstream: String,
        /** \brief 管理员哈希修复策略：malformed | mismatch */
        #[arg(long, env = "CHATBOX_ADMIN_REPAIR", default_value = "malformed")]
        admin_repair: RepairPolicy,
    },

    /**
     * \brief 仅执行数据库迁移。
     */
    Migrate {
        #[command(flatten)]
        database: DatabaseArgs,
        /** \brief 只列出迁移状态，不执行 */
        #[arg(long, default_value_t = false)]
        status: bool,
    },

    /**
     * \brief 重置 admin 密码（默认 admin123）。
     */
    ResetPassword {
        password: Option<String>,
        #[command(flatten)]
        database: DatabaseArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(cli.log_json);

    match cli.command {
        Commands::Serve {
            addr,
            database,
            jwt_secret,
            default_upstream,
            admin_repair,
        } => {
            let mut cfg = Config::default();
            cfg.server.addr = addr;
            cfg.server.default_upstream = default_upstream;
            cfg.database = database.into_config();
            cfg.auth.jwt_secret = jwt_secret;
            cfg.seed.repair_policy = admin_repair;
            server::run(cfg).await?;
        }
        Commands::Migrate { database, status } => {
            let db_cfg = database.into_config();
            let store = Store::connect(&db_cfg).context("open database failed")?;
            let conn = store.conn()?;
            let migrator = Migrator::new(&db_cfg.migrations_dir);
            if status {
                for entry in migrator.status(&conn).context("read migration status failed")? {
                    println!(
                        "{:>4}  {:<8}  {}  {}",
                        entry.version,
                        if entry.applied { "applied" } else { "pending" },
                        entry.filename,
                        entry.executed_at.unwrap_or_default()
                    );
                }
            } else {
                let report = migrator.run(&conn).context("apply migrations failed")?;
                println!(
                    "Applied {} migration(s), {} already up to date",
                    report.applied.len(),
                    report.skipped.len()
                );
            }
        }
        Commands::ResetPassword { password, database } => {
            let password = password.unwrap_or_else(|| seed::DEFAULT_ADMIN_PASSWORD.to_string());
            if password.chars().count() < MIN_PASSWORD_LEN {
                bail!("password must be at least {} characters", MIN_PASSWORD_LEN);
            }
            let store = Store::connect(&database.into_config()).context("open database failed")?;
            let conn = store.conn()?;
            let hash = Argon2Hasher.hash(&password).context("hash password failed")?;
            let updated = db::reset_password(&conn, seed::DEFAULT_ADMIN_USERNAME, &hash)
                .context("update admin password failed")?;
            if updated == 0 {
                bail!(
                    "no '{}' user found, start the server once to create it",
                    seed::DEFAULT_ADMIN_USERNAME
                );
            }
            info!("admin password reset from command line");
            println!("Admin password reset to: {}", password);
        }
    }

    Ok(())
}
