//! One-shot 模式
//!
//! 每次调用执行一条命令：
//! 1. 读取配置，装配网关
//! 2. 执行命令（Ctrl-C 请求取消）
//! 3. 打印结果，关闭会话

use anyhow::Result;
use asrs_control::{AsyncGateway, Command, CommandResponse, LivePlc, LiveShuttle, SystemConfig, build_gateway};
use tracing::warn;

pub struct OneShotMode {
    gateway: AsyncGateway<LiveShuttle, LivePlc>,
}

impl OneShotMode {
    pub fn new(config: &SystemConfig) -> Result<Self> {
        Ok(Self {
            gateway: AsyncGateway::new(build_gateway(config)?),
        })
    }

    pub async fn run(&self, command: Command, pretty: bool) -> Result<()> {
        let name = command.name();
        let pending = self.gateway.execute(command);
        tokio::pin!(pending);

        let response = tokio::select! {
            response = &mut pending => response,
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C: canceling {}", name);
                self.gateway.gateway().cancel();
                pending.await
            },
        };
        self.gateway.shutdown().await;

        println!("{}", render(&response, pretty)?);
        if response.success {
            Ok(())
        } else {
            anyhow::bail!("{} failed: {}", name, response.message)
        }
    }
}

pub fn render(response: &CommandResponse, pretty: bool) -> Result<String> {
    Ok(if pretty {
        serde_json::to_string_pretty(response)?
    } else {
        serde_json::to_string(response)?
    })
}
