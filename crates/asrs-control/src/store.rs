//! 库位存储
//!
//! 网关在命令成功后才提交库位变更。[`LocationStore`] 是外部存储的接入点，
//! 本 crate 提供内存实现与逐次落盘的 JSON 文件实现，两者都由地图的初始
//! 状态播种（提升机为 `lift`，通道为 `highway`，其余 `free`）。

use asrs_planner::{CellState, GridMap, StateMap};
use asrs_protocol::Coord;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// 存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid store JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown cell {0}")]
    UnknownCell(Coord),
    #[error("Cell {cell} is {status}, expected free")]
    CellNotFree { cell: Coord, status: CellState },
    #[error("Cell {0} holds no pallet")]
    CellEmpty(Coord),
    #[error("Pallet {pallet_id} is already stored at {cell}")]
    PalletAlreadyStored { pallet_id: String, cell: Coord },
    #[error("Pallet {0} not found")]
    PalletNotFound(String),
}

/// 单个库位记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    pub location: Coord,
    pub status: CellState,
    #[serde(default)]
    pub pallet_id: Option<String>,
}

impl CellRecord {
    fn empty(location: Coord, status: CellState) -> Self {
        Self {
            location,
            status,
            pallet_id: None,
        }
    }
}

/// 库位存储
pub trait LocationStore: Send + Sync {
    /// 全部库位，按坐标排序
    fn records(&self) -> Result<Vec<CellRecord>, StoreError>;

    fn record(&self, cell: Coord) -> Result<CellRecord, StoreError>;

    fn find_pallet(&self, pallet_id: &str) -> Result<Option<CellRecord>, StoreError>;

    /// 空闲库位放入托盘（`pallet_id` 未知时为 `None`）
    fn store_pallet(&self, cell: Coord, pallet_id: Option<&str>) -> Result<CellRecord, StoreError>;

    /// 取走库位上的托盘，库位回到 `free`
    fn remove_pallet(&self, cell: Coord) -> Result<CellRecord, StoreError>;

    /// 托盘换位，返回 `[源, 目标]`
    fn move_pallet(&self, from: Coord, to: Coord) -> Result<[CellRecord; 2], StoreError>;

    /// 规划器使用的状态快照
    fn states(&self) -> Result<StateMap, StoreError> {
        Ok(self
            .records()?
            .into_iter()
            .map(|r| (r.location, r.status))
            .collect())
    }
}

/// 两种实现共用的库存表
#[derive(Debug, Clone, Default)]
struct Inventory {
    cells: BTreeMap<Coord, CellRecord>,
}

impl Inventory {
    fn seeded(map: &GridMap) -> Self {
        let cells = map
            .initial_states()
            .into_iter()
            .map(|(c, s)| (c, CellRecord::empty(c, s)))
            .collect();
        Self { cells }
    }

    fn from_records(records: Vec<CellRecord>) -> Self {
        Self {
            cells: records.into_iter().map(|r| (r.location, r)).collect(),
        }
    }

    fn records(&self) -> Vec<CellRecord> {
        self.cells.values().cloned().collect()
    }

    fn get(&self, cell: Coord) -> Result<&CellRecord, StoreError> {
        self.cells.get(&cell).ok_or(StoreError::UnknownCell(cell))
    }

    fn find(&self, pallet_id: &str) -> Option<&CellRecord> {
        self.cells
            .values()
            .find(|r| r.pallet_id.as_deref() == Some(pallet_id))
    }

    fn store(&mut self, cell: Coord, pallet_id: Option<&str>) -> Result<CellRecord, StoreError> {
        if let Some(id) = pallet_id
            && let Some(existing) = self.find(id)
        {
            return Err(StoreError::PalletAlreadyStored {
                pallet_id: id.to_string(),
                cell: existing.location,
            });
        }
        let record = self.cells.get_mut(&cell).ok_or(StoreError::UnknownCell(cell))?;
        if record.status != CellState::Free {
            return Err(StoreError::CellNotFree {
                cell,
                status: record.status,
            });
        }
        record.status = CellState::Occupied;
        record.pallet_id = pallet_id.map(str::to_string);
        Ok(record.clone())
    }

    fn remove(&mut self, cell: Coord) -> Result<CellRecord, StoreError> {
        let record = self.cells.get_mut(&cell).ok_or(StoreError::UnknownCell(cell))?;
        if record.status != CellState::Occupied {
            return Err(StoreError::CellEmpty(cell));
        }
        record.status = CellState::Free;
        record.pallet_id = None;
        Ok(record.clone())
    }

    fn relocate(&mut self, from: Coord, to: Coord) -> Result<[CellRecord; 2], StoreError> {
        let pallet_id = {
            let src = self.get(from)?;
            if src.status != CellState::Occupied {
                return Err(StoreError::CellEmpty(from));
            }
            src.pallet_id.clone()
        };
        let dst = self.get(to)?;
        if dst.status != CellState::Free {
            return Err(StoreError::CellNotFree {
                cell: to,
                status: dst.status,
            });
        }
        let src = self.remove(from)?;
        let dst = self.store(to, pallet_id.as_deref())?;
        Ok([src, dst])
    }
}

/// 内存库位存储
#[derive(Debug)]
pub struct MemoryLocationStore {
    inner: RwLock<Inventory>,
}

impl MemoryLocationStore {
    pub fn new(map: &GridMap) -> Self {
        Self {
            inner: RwLock::new(Inventory::seeded(map)),
        }
    }
}

impl LocationStore for MemoryLocationStore {
    fn records(&self) -> Result<Vec<CellRecord>, StoreError> {
        Ok(self.inner.read().records())
    }

    fn record(&self, cell: Coord) -> Result<CellRecord, StoreError> {
        self.inner.read().get(cell).cloned()
    }

    fn find_pallet(&self, pallet_id: &str) -> Result<Option<CellRecord>, StoreError> {
        Ok(self.inner.read().find(pallet_id).cloned())
    }

    fn store_pallet(&self, cell: Coord, pallet_id: Option<&str>) -> Result<CellRecord, StoreError> {
        self.inner.write().store(cell, pallet_id)
    }

    fn remove_pallet(&self, cell: Coord) -> Result<CellRecord, StoreError> {
        self.inner.write().remove(cell)
    }

    fn move_pallet(&self, from: Coord, to: Coord) -> Result<[CellRecord; 2], StoreError> {
        self.inner.write().relocate(from, to)
    }
}

/// JSON 文件库位存储
///
/// 每次变更后整体写入临时文件再改名替换。
#[derive(Debug)]
pub struct JsonFileLocationStore {
    path: PathBuf,
    inner: Mutex<Inventory>,
}

impl JsonFileLocationStore {
    /// 打开已有文件；文件不存在时由地图播种并立即落盘
    pub fn open(path: impl AsRef<Path>, map: &GridMap) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let inventory = if path.exists() {
            let text = fs::read_to_string(&path)?;
            let records: Vec<CellRecord> = serde_json::from_str(&text)?;
            info!("Loaded {} cell records from {}", records.len(), path.display());
            Inventory::from_records(records)
        } else {
            info!("Seeding location store at {}", path.display());
            let inventory = Inventory::seeded(map);
            persist(&path, &inventory)?;
            inventory
        };
        Ok(Self {
            path,
            inner: Mutex::new(inventory),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Inventory) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let mut inventory = self.inner.lock();
        let mut next = inventory.clone();
        let out = f(&mut next)?;
        persist(&self.path, &next)?;
        *inventory = next;
        Ok(out)
    }
}

fn persist(path: &Path, inventory: &Inventory) -> Result<(), StoreError> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(&inventory.records())?)?;
    fs::rename(&tmp, path)?;
    debug!("Persisted location store to {}", path.display());
    Ok(())
}

impl LocationStore for JsonFileLocationStore {
    fn records(&self) -> Result<Vec<CellRecord>, StoreError> {
        Ok(self.inner.lock().records())
    }

    fn record(&self, cell: Coord) -> Result<CellRecord, StoreError> {
        self.inner.lock().get(cell).cloned()
    }

    fn find_pallet(&self, pallet_id: &str) -> Result<Option<CellRecord>, StoreError> {
        Ok(self.inner.lock().find(pallet_id).cloned())
    }

    fn store_pallet(&self, cell: Coord, pallet_id: Option<&str>) -> Result<CellRecord, StoreError> {
        self.mutate(|inv| inv.store(cell, pallet_id))
    }

    fn remove_pallet(&self, cell: Coord) -> Result<CellRecord, StoreError> {
        self.mutate(|inv| inv.remove(cell))
    }

    fn move_pallet(&self, from: Coord, to: Coord) -> Result<[CellRecord; 2], StoreError> {
        self.mutate(|inv| inv.relocate(from, to))
    }
}
