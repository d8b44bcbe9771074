//! 日志初始化
//!
//! 日志写 stderr（stdout 留给命令结果）；指定目录时另写一份按日轮转的文件。

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_DIRECTIVES: &str = "asrs_cli=info,asrs_control=info,asrs_driver=info,asrs_link=warn";

/// 返回的 guard 需保持到进程退出，否则文件日志可能丢尾
pub fn init(log_dir: Option<&Path>, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => EnvFilter::try_new("debug")?,
        Err(_) => EnvFilter::try_new(DEFAULT_DIRECTIVES)?,
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "asrs.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}
