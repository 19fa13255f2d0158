use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/**
 * \brief 安装全局 tracing 订阅者。
 * \details 日志级别取自 `RUST_LOG`，缺省为 info；`json` 为 true 时输出结构化日志。
 * 重复调用时静默忽略（测试中常见）。
 */
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    if let Err(err) = result {
        eprintln!("logging already initialised: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_does_not_panic() {
        init(false);
        init(true);
        tracing::info!("still alive");
    }
}
