//! 运行模式
//!
//! - `oneshot`: 执行一条命令后退出
//! - `serve`: 在 stdin/stdout 上持续应答 JSON 命令

pub mod oneshot;
pub mod serve;
