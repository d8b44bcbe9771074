//! # ASRS CLI
//!
//! 立体库核心的命令行入口。
//!
//! ### One-shot 模式
//!
//! ```bash
//! asrs-cli config init
//! asrs-cli car-location
//! asrs-cli inbound --cell 1,1,2 --pallet P1001
//! asrs-cli outbound --cell 1,1,2 --pallet P1001
//! ```
//!
//! ### 服务模式
//!
//! ```bash
//! $ asrs-cli serve
//! {"id": 1, "command": "cross_layer", "target_layer": 3}
//! {"id":1,"success":true,"message":"ok","data":"5,3,3"}
//! ```

use anyhow::Result;
use asrs_control::{AsyncGateway, SystemConfig, build_gateway};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

mod commands;
mod logging;
mod modes;

use commands::{ConfigCommand, DeviceCommand};
use modes::oneshot::OneShotMode;

/// ASRS CLI - 立体库设备命令行工具
#[derive(Parser, Debug)]
#[command(name = "asrs-cli")]
#[command(about = "Command-line interface for the AS/RS shuttle, lift and conveyor core", long_about = None)]
#[command(version)]
struct Cli {
    /// 配置文件（默认使用用户配置目录下的 asrs/config.toml）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 另写一份按日轮转的日志到该目录
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// 调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    /// 紧凑输出单行 JSON
    #[arg(long, global = true)]
    compact: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 配置管理
    #[command(subcommand)]
    Config(ConfigCommand),

    /// 在 stdin/stdout 上服务 JSON Lines 命令
    Serve,

    #[command(flatten)]
    Device(DeviceCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init(cli.log_dir.as_deref(), cli.verbose)?;

    match cli.command {
        Commands::Config(cmd) => cmd.execute(cli.config.as_deref()),

        Commands::Serve => {
            let (config, from) = SystemConfig::locate(cli.config.as_deref())?;
            if let Some(path) = from {
                info!("Config loaded from {}", path.display());
            }
            let gateway = AsyncGateway::new(build_gateway(&config)?);
            modes::serve::run(gateway).await
        },

        Commands::Device(cmd) => {
            let (config, _) = SystemConfig::locate(cli.config.as_deref())?;
            let mode = OneShotMode::new(&config)?;
            mode.run(cmd.into_command(), !cli.compact).await
        },
    }
}
