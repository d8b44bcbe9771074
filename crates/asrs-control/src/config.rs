//! 系统配置
//!
//! TOML 文件，分 `[shuttle]`、`[plc]`、`[map]`、`[coordinator]`、`[store]`
//! 五节；缺省字段取默认值。
//!
//! 默认路径：
//! - Linux: `~/.config/asrs/config.toml`
//! - macOS: `~/Library/Application Support/asrs/config.toml`
//! - Windows: `%APPDATA%\asrs\config.toml`

use crate::store::StoreError;
use asrs_driver::ShuttleTiming;
use asrs_link::{PlcTiming, RetryPolicy};
use asrs_planner::{CellState, GridMap, PlannerError};
use asrs_protocol::Coord;
use asrs_protocol::coord::{FLOOR_COUNT, LIFT_Y, STAGING_XS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Map error: {0}")]
    Map(#[from] PlannerError),
    #[error("Location store error: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuttleConfig {
    pub host: String,
    pub port: u16,
    pub device_id: u8,
    pub poll_interval_ms: u64,
    pub initial_grace_ms: u64,
    pub action_timeout_s: u64,
    pub response_timeout_ms: u64,
    pub heartbeat_attempts: u32,
    pub connect_retries: u32,
    pub retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ShuttleConfig {
    fn default() -> Self {
        Self {
            host: "192.168.8.30".to_string(),
            port: 2504,
            device_id: 2,
            poll_interval_ms: 1000,
            initial_grace_ms: 2000,
            action_timeout_s: 120,
            response_timeout_ms: 2000,
            heartbeat_attempts: 3,
            connect_retries: 3,
            retry_interval_ms: 1000,
            connect_timeout_ms: 3000,
        }
    }
}

impl ShuttleConfig {
    pub fn timing(&self) -> ShuttleTiming {
        ShuttleTiming {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            initial_grace: Duration::from_millis(self.initial_grace_ms),
            action_timeout: Duration::from_secs(self.action_timeout_s),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            heartbeat_attempts: self.heartbeat_attempts,
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_retries, Duration::from_millis(self.retry_interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcConfig {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    pub poll_interval_ms: u64,
    pub initial_grace_ms: u64,
    /// 上升沿锁存信号的稳定延时
    pub settle_ms: u64,
    pub action_timeout_s: u64,
    pub connect_retries: u32,
    pub retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            host: "192.168.8.10".to_string(),
            port: 102,
            rack: 0,
            slot: 1,
            poll_interval_ms: 500,
            initial_grace_ms: 2000,
            settle_ms: 1000,
            action_timeout_s: 30,
            connect_retries: 3,
            retry_interval_ms: 1000,
            connect_timeout_ms: 3000,
            io_timeout_ms: 2000,
        }
    }
}

impl PlcConfig {
    pub fn timing(&self) -> PlcTiming {
        PlcTiming {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            initial_grace: Duration::from_millis(self.initial_grace_ms),
            settle: Duration::from_millis(self.settle_ms),
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_retries, Duration::from_millis(self.retry_interval_ms))
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapSection {
    /// 地图 JSON；未设置时使用内置仓库地图
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// 每层暂存位的 `[x, y]`，顺序即使用顺序
    pub staging: Vec<[u8; 2]>,
    /// 关闭时等待在途动作的上限
    pub shutdown_timeout_s: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            staging: STAGING_XS.iter().map(|x| [*x, LIFT_Y]).collect(),
            shutdown_timeout_s: 300,
        }
    }
}

impl CoordinatorConfig {
    /// 某层的暂存位
    pub fn staging_cells(&self, floor: u8) -> Vec<Coord> {
        self.staging.iter().map(|[x, y]| Coord::new(*x, *y, floor)).collect()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// 库位 JSON 文件；未设置时只保存在内存中
    pub path: Option<PathBuf>,
}

/// 系统配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub shuttle: ShuttleConfig,
    pub plc: PlcConfig,
    pub map: MapSection,
    pub coordinator: CoordinatorConfig,
    pub store: StoreSection,
}

impl SystemConfig {
    /// 默认配置文件路径
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("asrs").join("config.toml"))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// 显式路径优先，其次默认路径，都不存在时使用默认值
    ///
    /// 返回实际加载的文件路径（使用默认值时为 `None`）。
    pub fn locate(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        match Self::default_path() {
            Some(path) if path.exists() => Ok((Self::load(&path)?, Some(path))),
            _ => Ok((Self::default(), None)),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// 加载地图
    pub fn load_map(&self) -> Result<GridMap, ConfigError> {
        Ok(match &self.map.path {
            Some(path) => GridMap::load(path)?,
            None => GridMap::warehouse()?,
        })
    }

    /// 对照地图检查配置
    pub fn validate(&self, map: &GridMap) -> Result<(), ConfigError> {
        if self.shuttle.device_id == 0 {
            return Err(ConfigError::Invalid("shuttle.device_id must be non-zero".to_string()));
        }
        if self.shuttle.action_timeout_s == 0 || self.plc.action_timeout_s == 0 {
            return Err(ConfigError::Invalid("action timeouts must be non-zero".to_string()));
        }
        let initial = map.initial_states();
        for floor in 1..=FLOOR_COUNT {
            for cell in self.coordinator.staging_cells(floor) {
                match initial.get(&cell) {
                    None => {
                        return Err(ConfigError::Invalid(format!(
                            "staging cell {} is not on the map",
                            cell
                        )));
                    },
                    Some(CellState::Free) => {},
                    Some(state) => {
                        return Err(ConfigError::Invalid(format!(
                            "staging cell {} is {}",
                            cell, state
                        )));
                    },
                }
            }
        }
        Ok(())
    }
}
