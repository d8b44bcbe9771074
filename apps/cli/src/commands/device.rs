//! 设备命令
//!
//! 每个子命令对应一条网关命令；库位坐标写作 `x,y,z`。

use asrs_control::Command;
use asrs_protocol::Coord;
use clap::Subcommand;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// 查询车辆位置
    CarLocation,

    /// 查询车辆状态
    CarStatus,

    /// 查询车辆电量
    CarBattery,

    /// 查询提升机状态
    LiftState,

    /// 列出所有库位记录
    Locations,

    /// 读取入口扫码结果
    Qrcode,

    /// 车辆空车行驶到同层库位
    MoveCar {
        #[arg(long)]
        target: Coord,
    },

    /// 车辆在当前位置顶升货物，运到同层库位
    MoveGoods {
        #[arg(long)]
        target: Coord,
    },

    /// 提升机单独换层
    Lift {
        #[arg(long)]
        layer: u8,
    },

    /// 车辆经提升机换层
    CrossLayer {
        #[arg(long)]
        layer: u8,
    },

    /// 入库；给出托盘号时核对条码并处理阻挡
    Inbound {
        #[arg(long)]
        cell: Coord,
        #[arg(long)]
        pallet: Option<String>,
    },

    /// 出库；给出托盘号时核对库位并处理阻挡
    Outbound {
        #[arg(long)]
        cell: Coord,
        #[arg(long)]
        pallet: Option<String>,
    },

    /// 同层移库（处理阻挡）
    GoodMove {
        #[arg(long)]
        pallet: String,
        #[arg(long)]
        source: Coord,
        #[arg(long)]
        target: Coord,
    },

    /// 离 anchor 最近、不在 source → target 路径上的空闲库位
    NearestFree {
        #[arg(long)]
        source: Coord,
        #[arg(long)]
        target: Coord,
        #[arg(long)]
        anchor: Coord,
    },
}

impl DeviceCommand {
    pub fn into_command(self) -> Command {
        match self {
            DeviceCommand::CarLocation => Command::GetCarLocation,
            DeviceCommand::CarStatus => Command::GetCarStatus,
            DeviceCommand::CarBattery => Command::GetCarBattery,
            DeviceCommand::LiftState => Command::GetLiftState,
            DeviceCommand::Locations => Command::ReadLocations,
            DeviceCommand::Qrcode => Command::Qrcode,
            DeviceCommand::MoveCar { target } => Command::MoveCar { target },
            DeviceCommand::MoveGoods { target } => Command::MoveGoods { target },
            DeviceCommand::Lift { layer } => Command::Lift { target_layer: layer },
            DeviceCommand::CrossLayer { layer } => Command::CrossLayer { target_layer: layer },
            DeviceCommand::Inbound { cell, pallet: None } => Command::TaskInband { target_cell: cell },
            DeviceCommand::Inbound {
                cell,
                pallet: Some(pallet_id),
            } => Command::TaskInbandWithBlocking {
                target_cell: cell,
                pallet_id,
            },
            DeviceCommand::Outbound { cell, pallet: None } => Command::TaskOutband { target_cell: cell },
            DeviceCommand::Outbound {
                cell,
                pallet: Some(pallet_id),
            } => Command::TaskOutbandWithBlocking {
                target_cell: cell,
                pallet_id,
            },
            DeviceCommand::GoodMove { pallet, source, target } => Command::GoodMoveWithBlocking {
                pallet_id: pallet,
                source,
                target,
            },
            DeviceCommand::NearestFree { source, target, anchor } => {
                Command::NearestFreeCell { source, target, anchor }
            },
        }
    }
}
