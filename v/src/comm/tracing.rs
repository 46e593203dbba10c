use anyhow::Result;
use chrono::{Datelike, Timelike};
use tracing_subscriber::{fmt, EnvFilter};

/// 本地时间格式化 / Local wall-clock timer, `YYYY-MM-DD:HH:MM:SS:cc`
struct LogTimer;

impl fmt::time::FormatTime for LogTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        let cs = now.timestamp_subsec_millis() / 10;
        write!(
            w,
            "{:04}-{:02}-{:02}:{:02}:{:02}:{:02}:{:02}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            cs
        )
    }
}

/// 构建过滤器：`RUST_LOG` 优先，否则使用配置级别 / Build the filter, `RUST_LOG` wins over `level`
fn build_filter(level: &str) -> EnvFilter {
    if let Ok(directives) = std::env::var("RUST_LOG") {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }
    EnvFilter::try_new(format!("{},sqlx=warn", level))
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"))
}

/// 初始化全局 tracing 订阅者 / Install the global tracing subscriber
///
/// 重复调用是安全的，后续调用不生效 / Repeated calls are no-ops
pub fn init_tracing(level: &str) -> Result<()> {
    fmt::SubscriberBuilder::default()
        .with_env_filter(build_filter(level))
        .with_timer(LogTimer)
        .compact()
        .with_target(false)
        .try_init()
        .ok();
    Ok(())
}
