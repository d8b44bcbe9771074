//! 配置管理命令

use anyhow::{Context, Result};
use asrs_control::SystemConfig;
use clap::Subcommand;
use std::path::{Path, PathBuf};

/// 配置命令
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// 打印生效的配置（TOML）
    Show,

    /// 加载地图并检查配置
    Check,

    /// 写出一份默认配置
    Init {
        /// 覆盖已存在的文件
        #[arg(long)]
        force: bool,
    },

    /// 打印配置文件路径
    Path,
}

impl ConfigCommand {
    pub fn execute(self, explicit: Option<&Path>) -> Result<()> {
        match self {
            ConfigCommand::Show => Self::show_(explicit),
            ConfigCommand::Check => Self::check_(explicit),
            ConfigCommand::Init { force } => Self::init_(explicit, force),
            ConfigCommand::Path => {
                let path = target_path(explicit)?;
                println!("{}", path.display());
                Ok(())
            },
        }
    }

    fn show_(explicit: Option<&Path>) -> Result<()> {
        let (config, from) = SystemConfig::locate(explicit)?;
        match from {
            Some(path) => println!("# {}", path.display()),
            None => println!("# (defaults)"),
        }
        print!("{}", config.to_toml_string()?);
        Ok(())
    }

    fn check_(explicit: Option<&Path>) -> Result<()> {
        let (config, from) = SystemConfig::locate(explicit)?;
        let map = config.load_map().context("loading map")?;
        config.validate(&map)?;

        println!(
            "配置文件: {}",
            from.map(|p| p.display().to_string())
                .unwrap_or_else(|| "(defaults)".to_string())
        );
        println!("  车辆: {}:{} (id {})", config.shuttle.host, config.shuttle.port, config.shuttle.device_id);
        println!(
            "  PLC: {}:{} (rack {}, slot {})",
            config.plc.host, config.plc.port, config.plc.rack, config.plc.slot
        );
        println!("  地图: {} 个库位", map.node_count());
        println!("  暂存位: {:?}", config.coordinator.staging);
        println!("✅ 配置有效");
        Ok(())
    }

    fn init_(explicit: Option<&Path>, force: bool) -> Result<()> {
        let path = target_path(explicit)?;
        if path.exists() && !force {
            anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
        }
        SystemConfig::default()
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("✅ 已写入 {}", path.display());
        Ok(())
    }
}

fn target_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => SystemConfig::default_path().ok_or_else(|| anyhow::anyhow!("无法确定配置目录")),
    }
}
