//! 网格坐标
//!
//! 外部编码为字符串 `"x,y,z"`，内部为紧凑三元组。`z` 为楼层（1-4）。
//!
//! 排序规则为 `(z, y, x)` 字典序，所有平局裁决均使用此顺序。

use crate::ProtocolError;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// 楼层数
pub const FLOOR_COUNT: u8 = 4;

/// 提升机内部库位的 x/y（每层 `(6,3,z)`）
pub const LIFT_X: u8 = 6;
pub const LIFT_Y: u8 = 3;

/// 提升机门口接驳位的 x（每层 `(5,3,z)`）
pub const PRE_LIFT_X: u8 = 5;

/// 暂存位 x 范围（每层 `(1..=3,3,z)`）
pub const STAGING_XS: [u8; 3] = [1, 2, 3];

/// 网格坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct Coord {
    pub x: u8,
    pub y: u8,
    pub z: u8,
}

impl Coord {
    pub const fn new(x: u8, y: u8, z: u8) -> Self {
        Self { x, y, z }
    }

    /// 提升机内部库位 `(6,3,floor)`
    pub const fn lift(floor: u8) -> Self {
        Self::new(LIFT_X, LIFT_Y, floor)
    }

    /// 提升机门口接驳位 `(5,3,floor)`
    pub const fn pre_lift(floor: u8) -> Self {
        Self::new(PRE_LIFT_X, LIFT_Y, floor)
    }

    /// 默认暂存位列表 `[(1,3,z), (2,3,z), (3,3,z)]`
    pub fn staging(floor: u8) -> [Coord; 3] {
        STAGING_XS.map(|x| Coord::new(x, LIFT_Y, floor))
    }

    pub fn floor(&self) -> u8 {
        self.z
    }

    pub fn is_lift_cell(&self) -> bool {
        self.x == LIFT_X && self.y == LIFT_Y
    }

    /// 缓冲区库位：暂存位、接驳位、提升机，不可作为入库目标
    pub fn is_buffer_cell(&self) -> bool {
        self.y == LIFT_Y
            && (STAGING_XS.contains(&self.x) || self.x == PRE_LIFT_X || self.x == LIFT_X)
    }

    pub fn same_floor(&self, other: &Coord) -> bool {
        self.z == other.z
    }

    /// 曼哈顿距离（包含 z 轴）
    pub fn manhattan(&self, other: &Coord) -> u32 {
        let d = |a: u8, b: u8| (a as i32 - b as i32).unsigned_abs();
        d(self.x, other.x) + d(self.y, other.y) + d(self.z, other.z)
    }

    /// 同一坐标换层
    pub fn with_floor(&self, floor: u8) -> Self {
        Self::new(self.x, self.y, floor)
    }

    fn sort_key(&self) -> (u8, u8, u8) {
        (self.z, self.y, self.x)
    }
}

impl Ord for Coord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Coord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

impl FromStr for Coord {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(ProtocolError::InvalidCoord(s.to_string()));
        }
        let parse = |p: &str| p.parse::<u8>().map_err(|_| ProtocolError::InvalidCoord(s.to_string()));
        Ok(Coord::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl TryFrom<String> for Coord {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Coord> for String {
    fn from(coord: Coord) -> Self {
        coord.to_string()
    }
}
