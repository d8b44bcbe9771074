//! 路径规划
//!
//! 地图是树，`shortest_path` 返回的即唯一简单路径。邻居按坐标序遍历，
//! 结果对同一张地图总是确定的。

use crate::map::GridMap;
use crate::{CellState, PlannerError, StateMap};
use asrs_protocol::{Coord, Segment, SegmentAction};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// 单步行驶方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    X,
    Y,
    /// 跨层（只有提升机走这类边）
    Z,
}

impl Direction {
    /// 相邻两点之间的方向；斜向一步返回 `None`
    pub fn between(from: Coord, to: Coord) -> Option<Direction> {
        if from.z != to.z {
            return Some(Direction::Z);
        }
        match (from.x != to.x, from.y != to.y) {
            (true, false) => Some(Direction::X),
            (false, true) => Some(Direction::Y),
            _ => None,
        }
    }

    /// 在拐点上切换到本方向时使用的段动作
    pub fn turn_action(self) -> SegmentAction {
        match self {
            Direction::X => SegmentAction::XTurn,
            Direction::Y => SegmentAction::YTurn,
            Direction::Z => SegmentAction::Straight,
        }
    }
}

/// 路径规划器
#[derive(Debug, Clone)]
pub struct PathPlanner {
    map: GridMap,
}

impl PathPlanner {
    pub fn new(map: GridMap) -> Self {
        Self { map }
    }

    pub fn map(&self) -> &GridMap {
        &self.map
    }

    fn ensure_known(&self, cell: Coord) -> Result<(), PlannerError> {
        if self.map.contains(&cell) {
            Ok(())
        } else {
            Err(PlannerError::UnknownCell(cell))
        }
    }

    /// 两点间的树路径（含两端）；`a == b` 时为空
    pub fn shortest_path(&self, a: Coord, b: Coord) -> Result<Vec<Coord>, PlannerError> {
        self.ensure_known(a)?;
        self.ensure_known(b)?;
        if a == b {
            return Ok(Vec::new());
        }

        let mut parent: BTreeMap<Coord, Coord> = BTreeMap::new();
        let mut seen = BTreeSet::from([a]);
        let mut queue = VecDeque::from([a]);
        while let Some(node) = queue.pop_front() {
            if node == b {
                break;
            }
            for next in self.map.neighbors(node) {
                if seen.insert(*next) {
                    parent.insert(*next, node);
                    queue.push_back(*next);
                }
            }
        }

        let mut path = vec![b];
        let mut cursor = b;
        while cursor != a {
            // 树已在加载时校验连通
            let Some(prev) = parent.get(&cursor) else {
                return Err(PlannerError::NotATree(format!("{} is unreachable from {}", b, a)));
            };
            cursor = *prev;
            path.push(cursor);
        }
        path.reverse();
        Ok(path)
    }

    /// 在方向变化处切分路径，拐点同时属于前后两段
    ///
    /// 斜向一步沿用前一段的方向。
    pub fn cut(path: &[Coord]) -> Vec<Vec<Coord>> {
        let Some((&first, rest)) = path.split_first() else {
            return Vec::new();
        };

        let mut pieces = Vec::new();
        let mut current = vec![first];
        let mut heading: Option<Direction> = None;
        let mut prev = first;
        for &cell in rest {
            let step = Direction::between(prev, cell).or(heading);
            if heading.is_some() && step != heading {
                let joint = prev;
                pieces.push(std::mem::replace(&mut current, vec![joint]));
            }
            heading = step;
            current.push(cell);
            prev = cell;
        }
        pieces.push(current);
        pieces
    }

    /// 每段收缩为 (起点, 终点)
    pub fn to_task_points(pieces: &[Vec<Coord>]) -> Vec<(Coord, Coord)> {
        pieces
            .iter()
            .filter_map(|p| Some((*p.first()?, *p.last()?)))
            .collect()
    }

    /// 生成任务段：起点与终点为直行，中间拐点标注换向动作
    pub fn build_segments(&self, a: Coord, b: Coord) -> Result<Vec<Segment>, PlannerError> {
        let path = self.shortest_path(a, b)?;
        let pieces = Self::cut(&path);
        let points = Self::to_task_points(&pieces);
        let Some(&(start, _)) = points.first() else {
            return Ok(Vec::new());
        };

        let mut segments = Vec::with_capacity(points.len() + 1);
        segments.push(Segment::new(start, SegmentAction::Straight));
        for (i, &(_, end)) in points.iter().enumerate() {
            let action = match pieces.get(i + 1) {
                Some(next) => next
                    .get(..2)
                    .and_then(|w| Direction::between(w[0], w[1]))
                    .map(Direction::turn_action)
                    .unwrap_or_default(),
                None => SegmentAction::Straight,
            };
            segments.push(Segment::new(end, action));
        }
        debug!("Segments {} -> {}: {:?}", a, b, segments);
        Ok(segments)
    }

    /// 取放货任务：首段为顶升，末段为下降
    pub fn build_pick_task(&self, a: Coord, b: Coord) -> Result<Vec<Segment>, PlannerError> {
        let mut segments = self.build_segments(a, b)?;
        if let Some(first) = segments.first_mut() {
            first.action = SegmentAction::Pick;
        }
        if segments.len() > 1 {
            if let Some(last) = segments.last_mut() {
                last.action = SegmentAction::Drop;
            }
        }
        Ok(segments)
    }

    fn is_transit(&self, cell: &Coord, states: &StateMap) -> bool {
        cell.is_lift_cell()
            || self.map.is_highway(cell)
            || states.get(cell).is_some_and(|s| s.is_transit())
    }

    /// 源与目标之间（不含两端）被占用的非通道库位，按路径顺序
    pub fn find_blocking_nodes(
        &self,
        source: Coord,
        target: Coord,
        states: &StateMap,
    ) -> Result<Vec<Coord>, PlannerError> {
        let path = self.shortest_path(source, target)?;
        let inner = path.get(1..path.len().saturating_sub(1)).unwrap_or_default();
        Ok(inner
            .iter()
            .filter(|c| !self.is_transit(c, states))
            .filter(|c| states.get(c) == Some(&CellState::Occupied))
            .copied()
            .collect())
    }

    /// 到最近通道库位的曼哈顿距离
    fn highway_distance(&self, cell: &Coord, states: &StateMap) -> u32 {
        let from_states = states
            .iter()
            .filter(|(_, s)| **s == CellState::Highway)
            .map(|(c, _)| c);
        from_states
            .chain(self.map.highway_cells())
            .map(|h| cell.manhattan(h))
            .min()
            .unwrap_or(u32::MAX)
    }

    /// 按离通道的距离排序（平局按坐标序）
    pub fn rank_by_highway(&self, candidates: &[Coord], states: &StateMap) -> Vec<Coord> {
        let mut ranked: Vec<(u32, Coord)> = candidates
            .iter()
            .map(|c| (self.highway_distance(c, states), *c))
            .collect();
        ranked.sort();
        ranked.dedup();
        ranked.into_iter().map(|(_, c)| c).collect()
    }

    /// 候选中离通道最近的一个
    pub fn find_nearest_highway_node(&self, candidates: &[Coord], states: &StateMap) -> Option<Coord> {
        self.rank_by_highway(candidates, states).into_iter().next()
    }

    /// 离 `anchor` 最近的空闲库位
    ///
    /// 候选须与 `anchor` 同层、不在 `source → target` 路径上、不是缓冲区或通道，
    /// 且从 `anchor` 过去的路上没有其他货物。
    pub fn find_nearest_free_node(
        &self,
        source: Coord,
        target: Coord,
        anchor: Coord,
        states: &StateMap,
    ) -> Result<Option<Coord>, PlannerError> {
        self.ensure_known(anchor)?;
        let on_path: BTreeSet<Coord> = self.shortest_path(source, target)?.into_iter().collect();

        let mut candidates: Vec<(u32, Coord)> = self
            .map
            .nodes()
            .filter(|c| c.same_floor(&anchor) && **c != anchor)
            .filter(|c| states.get(c) == Some(&CellState::Free))
            .filter(|c| !c.is_buffer_cell() && !self.is_transit(c, states))
            .filter(|c| !on_path.contains(c) && **c != source && **c != target)
            .map(|c| (c.manhattan(&anchor), *c))
            .collect();
        candidates.sort();

        for (_, cell) in candidates {
            if self.find_blocking_nodes(anchor, cell, states)?.is_empty() {
                return Ok(Some(cell));
            }
        }
        Ok(None)
    }
}
