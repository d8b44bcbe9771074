//! # ASRS Planner
//!
//! 穿梭车网格规划器。
//!
//! 地图是一棵树（启动时校验），因此任意两点之间只有唯一一条简单路径；
//! 路径切分、阻挡识别都依赖这一性质。
//!
//! - [`GridMap`]：地图加载与树校验
//! - [`PathPlanner`]：路径、切分、任务段、阻挡与空位搜索
//! - [`CellState`]：库位状态（由外部库存提供的快照）

use asrs_protocol::Coord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod map;
pub mod planner;

pub use map::{GridMap, MapConfig};
pub use planner::{Direction, PathPlanner};

/// 规划错误
#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid map JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid map: {0}")]
    InvalidMap(String),
    /// 地图不是树（存在环或不连通）
    #[error("Map is not a tree: {0}")]
    NotATree(String),
    #[error("Unknown cell {0}")]
    UnknownCell(Coord),
}

/// 库位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    Free,
    Occupied,
    Highway,
    Lift,
}

impl CellState {
    /// 可通行但不可存储
    pub fn is_transit(self) -> bool {
        matches!(self, CellState::Highway | CellState::Lift)
    }
}

impl fmt::Display for CellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CellState::Free => "free",
            CellState::Occupied => "occupied",
            CellState::Highway => "highway",
            CellState::Lift => "lift",
        };
        f.write_str(s)
    }
}

/// 库位状态快照
pub type StateMap = BTreeMap<Coord, CellState>;
