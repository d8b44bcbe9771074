//! 设备抽象
//!
//! 协调器只依赖这两个 trait；真实控制器与测试用的记录型设备都实现它们。

use crate::error::DriverError;
use crate::plc::{ConveyorRoute, LiftMove};
use asrs_protocol::{Coord, FloorSignal, HeartbeatStatus, LiftState, ShuttleStatus};
use std::time::Duration;

/// 穿梭车
pub trait ShuttleDevice: Send {
    fn connect(&mut self) -> Result<(), DriverError>;
    fn disconnect(&mut self);

    fn heartbeat(&mut self) -> Result<HeartbeatStatus, DriverError>;

    fn position(&mut self) -> Result<Coord, DriverError> {
        Ok(self.heartbeat()?.position)
    }

    fn status(&mut self) -> Result<ShuttleStatus, DriverError> {
        Ok(self.heartbeat()?.car_status)
    }

    /// 电量百分比
    fn battery(&mut self) -> Result<u8, DriverError>;

    /// 更新车辆自身坐标（仅在提升机轿厢内调用）
    fn relocate(&mut self, task_no: u8, coord: Coord) -> Result<(), DriverError>;

    /// 空车行驶到 `target`
    fn move_to(&mut self, task_no: u8, target: Coord) -> Result<(), DriverError>;

    /// 在当前位置顶升货物，运到 `target` 放下
    fn good_move(&mut self, task_no: u8, target: Coord) -> Result<(), DriverError>;

    fn wait_arrived(&mut self, target: Coord, timeout: Duration) -> Result<(), DriverError>;

    /// 单个动作的默认截止时间
    fn action_timeout(&self) -> Duration;
}

/// 提升机与输送线
pub trait PlcDevice: Send {
    fn connect(&mut self) -> Result<(), DriverError>;
    fn disconnect(&mut self);

    fn lift_state(&mut self) -> Result<LiftState, DriverError>;

    /// 无故障、自动模式、远程在线、输送线在线
    fn plc_checker(&mut self) -> Result<(), DriverError>;

    fn lift_move_by_layer(&mut self, task_no: u16, floor: u8) -> Result<LiftMove, DriverError>;

    /// 等待提升机停靠 `floor` 且空闲
    fn wait_lift_at(&mut self, floor: u8) -> Result<LiftState, DriverError>;

    fn convey(&mut self, route: ConveyorRoute) -> Result<(), DriverError>;

    fn pulse_floor_signal(&mut self, signal: FloorSignal, floor: u8) -> Result<(), DriverError>;

    /// 扫码结果；扫码未就绪时为 `None`
    fn scan_qrcode(&mut self) -> Result<Option<String>, DriverError>;
}

impl<T: ShuttleDevice + ?Sized> ShuttleDevice for Box<T> {
    fn connect(&mut self) -> Result<(), DriverError> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn heartbeat(&mut self) -> Result<HeartbeatStatus, DriverError> {
        (**self).heartbeat()
    }

    fn position(&mut self) -> Result<Coord, DriverError> {
        (**self).position()
    }

    fn status(&mut self) -> Result<ShuttleStatus, DriverError> {
        (**self).status()
    }

    fn battery(&mut self) -> Result<u8, DriverError> {
        (**self).battery()
    }

    fn relocate(&mut self, task_no: u8, coord: Coord) -> Result<(), DriverError> {
        (**self).relocate(task_no, coord)
    }

    fn move_to(&mut self, task_no: u8, target: Coord) -> Result<(), DriverError> {
        (**self).move_to(task_no, target)
    }

    fn good_move(&mut self, task_no: u8, target: Coord) -> Result<(), DriverError> {
        (**self).good_move(task_no, target)
    }

    fn wait_arrived(&mut self, target: Coord, timeout: Duration) -> Result<(), DriverError> {
        (**self).wait_arrived(target, timeout)
    }

    fn action_timeout(&self) -> Duration {
        (**self).action_timeout()
    }
}

impl<T: PlcDevice + ?Sized> PlcDevice for Box<T> {
    fn connect(&mut self) -> Result<(), DriverError> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn lift_state(&mut self) -> Result<LiftState, DriverError> {
        (**self).lift_state()
    }

    fn plc_checker(&mut self) -> Result<(), DriverError> {
        (**self).plc_checker()
    }

    fn lift_move_by_layer(&mut self, task_no: u16, floor: u8) -> Result<LiftMove, DriverError> {
        (**self).lift_move_by_layer(task_no, floor)
    }

    fn wait_lift_at(&mut self, floor: u8) -> Result<LiftState, DriverError> {
        (**self).wait_lift_at(floor)
    }

    fn convey(&mut self, route: ConveyorRoute) -> Result<(), DriverError> {
        (**self).convey(route)
    }

    fn pulse_floor_signal(&mut self, signal: FloorSignal, floor: u8) -> Result<(), DriverError> {
        (**self).pulse_floor_signal(signal, floor)
    }

    fn scan_qrcode(&mut self) -> Result<Option<String>, DriverError> {
        (**self).scan_qrcode()
    }
}
