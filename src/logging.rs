use anyhow::Result;
use chrono::{Datelike, Timelike};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

struct LogTimer;

impl fmt::time::FormatTime for LogTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        let cs = now.timestamp_subsec_millis() / 10;
        let s = format!(
            "{:04}-{:02}-{:02}:{:02}:{:02}:{:02}:{:02}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            cs
        );
        w.write_str(&s)
    }
}

/// 初始化日志 / Initialize tracing
///
/// `level` 来自配置文件，RUST_LOG 环境变量优先
/// `level` comes from the config file; RUST_LOG takes precedence
pub fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    LogTracer::init().ok();
    fmt::SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_timer(LogTimer)
        .compact()
        .with_target(false)
        .try_init()
        .ok();
    Ok(())
}
