//! 命令定义

pub mod config;
pub mod device;

pub use config::ConfigCommand;
pub use device::DeviceCommand;
