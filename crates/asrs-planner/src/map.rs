//! 地图配置
//!
//! JSON 格式：
//!
//! ```json
//! {"nodes": ["x,y,z", ...], "edges": [["x,y,z", "x,y,z"], ...], "highway": ["x,y,z", ...]}
//! ```
//!
//! `highway` 可省略。加载时校验图是一棵树：边数 = 节点数 - 1 且连通。

use crate::{CellState, PlannerError, StateMap};
use asrs_protocol::Coord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use tracing::info;

/// 随仓库发布的四层地图
const WAREHOUSE_MAP: &str = include_str!("../maps/warehouse.json");

/// 地图配置（反序列化形式）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapConfig {
    pub nodes: Vec<Coord>,
    pub edges: Vec<[Coord; 2]>,
    #[serde(default)]
    pub highway: Vec<Coord>,
}

/// 只读地图（树）
#[derive(Debug, Clone)]
pub struct GridMap {
    adjacency: BTreeMap<Coord, BTreeSet<Coord>>,
    highway: BTreeSet<Coord>,
}

impl GridMap {
    pub fn from_config(config: MapConfig) -> Result<Self, PlannerError> {
        if config.nodes.is_empty() {
            return Err(PlannerError::InvalidMap("map has no nodes".to_string()));
        }

        let mut adjacency: BTreeMap<Coord, BTreeSet<Coord>> = BTreeMap::new();
        for node in &config.nodes {
            if adjacency.insert(*node, BTreeSet::new()).is_some() {
                return Err(PlannerError::InvalidMap(format!("duplicate node {}", node)));
            }
        }

        for [a, b] in &config.edges {
            if a == b {
                return Err(PlannerError::InvalidMap(format!("self loop at {}", a)));
            }
            for end in [a, b] {
                if !adjacency.contains_key(end) {
                    return Err(PlannerError::InvalidMap(format!(
                        "edge {} - {} references unknown node {}",
                        a, b, end
                    )));
                }
            }
            let fresh = adjacency.get_mut(a).is_some_and(|n| n.insert(*b));
            if !fresh {
                return Err(PlannerError::NotATree(format!("duplicate edge {} - {}", a, b)));
            }
            if let Some(n) = adjacency.get_mut(b) {
                n.insert(*a);
            }
        }

        let highway: BTreeSet<Coord> = config.highway.iter().copied().collect();
        if let Some(unknown) = highway.iter().find(|c| !adjacency.contains_key(c)) {
            return Err(PlannerError::InvalidMap(format!("highway cell {} is not a node", unknown)));
        }

        let map = Self { adjacency, highway };
        map.check_tree(config.edges.len())?;
        info!(
            "Map loaded: {} nodes, {} edges, {} highway cells",
            map.node_count(),
            config.edges.len(),
            map.highway.len()
        );
        Ok(map)
    }

    /// 树：连通且边数 = 节点数 - 1
    fn check_tree(&self, edge_count: usize) -> Result<(), PlannerError> {
        let node_count = self.adjacency.len();
        if edge_count != node_count - 1 {
            return Err(PlannerError::NotATree(format!(
                "{} nodes need exactly {} edges, found {}",
                node_count,
                node_count - 1,
                edge_count
            )));
        }

        let Some(root) = self.adjacency.keys().next().copied() else {
            return Ok(());
        };
        let mut seen = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            for next in self.neighbors(node) {
                if seen.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }
        if seen.len() != node_count {
            let missing = self.adjacency.keys().find(|c| !seen.contains(c));
            return Err(PlannerError::NotATree(format!(
                "graph is disconnected ({} unreachable from {})",
                missing.map(|c| c.to_string()).unwrap_or_default(),
                root
            )));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, PlannerError> {
        Self::from_config(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PlannerError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// 随仓库发布的四层地图
    pub fn warehouse() -> Result<Self, PlannerError> {
        Self::from_json_str(WAREHOUSE_MAP)
    }

    pub fn contains(&self, cell: &Coord) -> bool {
        self.adjacency.contains_key(cell)
    }

    pub fn neighbors(&self, cell: Coord) -> impl Iterator<Item = &Coord> {
        self.adjacency.get(&cell).into_iter().flatten()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Coord> {
        self.adjacency.keys()
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_highway(&self, cell: &Coord) -> bool {
        self.highway.contains(cell)
    }

    pub fn highway_cells(&self) -> impl Iterator<Item = &Coord> {
        self.highway.iter()
    }

    /// 初始库位状态：提升机为 `lift`，通道为 `highway`，其余 `free`
    pub fn initial_states(&self) -> StateMap {
        self.nodes()
            .map(|c| {
                let state = if c.is_lift_cell() {
                    CellState::Lift
                } else if self.is_highway(c) {
                    CellState::Highway
                } else {
                    CellState::Free
                };
                (*c, state)
            })
            .collect()
    }

    pub fn to_config(&self) -> MapConfig {
        let mut edges = Vec::with_capacity(self.node_count().saturating_sub(1));
        for (a, next) in &self.adjacency {
            for b in next {
                if a < b {
                    edges.push([*a, *b]);
                }
            }
        }
        MapConfig {
            nodes: self.adjacency.keys().copied().collect(),
            edges,
            highway: self.highway.iter().copied().collect(),
        }
    }
}
