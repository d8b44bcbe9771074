//! 服务模式：stdin/stdout 上的 JSON Lines
//!
//! 每行一条请求 `{"id": .., "command": "..", ..}`，每条请求一行应答，
//! `id` 原样带回。请求并发执行；复合动作之间由操作锁串行化，
//! 锁被占用时只读查询由状态看板应答。
//!
//! stdin 结束时等待在途请求后关闭；Ctrl-C 取消在途动作后关闭。

use anyhow::Result;
use asrs_control::{AsyncGateway, Command, CommandError, CommandResponse, ErrorKind, PlcDevice, ShuttleDevice};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    command: Command,
}

#[derive(Debug, Serialize)]
struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(flatten)]
    response: CommandResponse,
}

/// 解析一行请求；无法解析时直接给出失败应答
fn parse_line(line: &str) -> Result<Request, Reply> {
    serde_json::from_str(line).map_err(|e| {
        let id = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|v| v.get("id").cloned());
        Reply {
            id,
            response: CommandResponse::failure(CommandError::new(
                ErrorKind::PreconditionFailed,
                format!("invalid request: {}", e),
            )),
        }
    })
}

/// 在标准输入输出上服务，直到 stdin 结束或收到 Ctrl-C
pub async fn run<S, P>(gateway: AsyncGateway<S, P>) -> Result<()>
where
    S: ShuttleDevice + 'static,
    P: PlcDevice + 'static,
{
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(gateway, stdin, stdout, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// 与传输无关的服务循环
pub async fn serve<S, P, R, W>(
    gateway: AsyncGateway<S, P>,
    reader: R,
    mut writer: W,
    interrupt: impl std::future::Future<Output = ()>,
) -> Result<()>
where
    S: ShuttleDevice + 'static,
    P: PlcDevice + 'static,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();
    let writer_task = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let mut line = match serde_json::to_string(&reply) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Cannot encode reply: {}", e);
                    continue;
                },
            };
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() || writer.flush().await.is_err() {
                warn!("Output closed, dropping replies");
                break;
            }
        }
    });

    info!("Serving JSON lines");
    let mut lines = reader.lines();
    let mut in_flight = JoinSet::new();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Input closed");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_line(line) {
                    Ok(Request { id, command }) => {
                        let gateway = gateway.clone();
                        let tx = tx.clone();
                        in_flight.spawn(async move {
                            let response = gateway.execute(command).await;
                            let _ = tx.send(Reply { id, response });
                        });
                    },
                    Err(reply) => {
                        let _ = tx.send(reply);
                    },
                }
            },
            _ = &mut interrupt => {
                warn!("Interrupted, canceling in-flight operation");
                gateway.gateway().cancel();
                break;
            },
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = done {
                    warn!("Request task failed: {}", e);
                }
            },
        }
    }

    while let Some(done) = in_flight.join_next().await {
        if let Err(e) = done {
            warn!("Request task failed: {}", e);
        }
    }
    if !gateway.shutdown().await {
        warn!("Shutdown timed out with an operation still running");
    }
    drop(tx);
    let _ = writer_task.await;
    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use asrs_control::{CommandGateway, DeviceCoordinator, LocationStore, MemoryLocationStore};
    use asrs_driver::sim::SimPlc;
    use asrs_driver::{PlcController, ShuttleController, StatusBoard};
    use asrs_link::mock::{MemoryPlc, SimShuttle};
    use asrs_planner::{GridMap, PathPlanner};
    use asrs_protocol::Coord;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn sim_gateway() -> AsyncGateway<ShuttleController<SimShuttle>, PlcController<MemoryPlc>> {
        let map = GridMap::warehouse().unwrap();
        let store: Arc<dyn LocationStore> = Arc::new(MemoryLocationStore::new(&map));
        let planner = Arc::new(PathPlanner::new(map));
        let shuttle = ShuttleController::new(SimShuttle::new(Coord::pre_lift(1)), 2, planner.clone());
        let plc = PlcController::new(SimPlc::healthy().link());
        let coordinator = DeviceCoordinator::new(shuttle, plc, planner);
        AsyncGateway::new(CommandGateway::new(coordinator, store, StatusBoard::new()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_answers_each_line() {
        let input: &[u8] = b"{\"id\":1,\"command\":\"get_car_location\"}\n\n{\"id\":2,\"command\":\"nope\"}\n{\"id\":3,\"command\":\"read_locations\"}\n";
        let (mut client, output) = tokio::io::duplex(1 << 20);
        serve(sim_gateway(), BufReader::new(input), output, std::future::pending())
            .await
            .unwrap();

        let mut text = String::new();
        client.read_to_string(&mut text).await.unwrap();
        let replies: BTreeMap<i64, Value> = text
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap())
            .map(|v| (v["id"].as_i64().unwrap(), v))
            .collect();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[&1]["data"], "5,3,1");
        assert_eq!(replies[&2]["success"], false);
        assert_eq!(replies[&3]["data"].as_array().unwrap().len(), 104);
    }

    #[test]
    fn test_parse_request_with_id() {
        let request = parse_line(r#"{"id": 7, "command": "lift", "target_layer": 3}"#).unwrap();
        assert_eq!(request.id, Some(Value::from(7)));
        assert_eq!(request.command, Command::Lift { target_layer: 3 });

        let request = parse_line(r#"{"command": "get_car_location"}"#).unwrap();
        assert!(request.id.is_none());
        assert_eq!(request.command, Command::GetCarLocation);
    }

    #[test]
    fn test_bad_request_keeps_id() {
        let reply = parse_line(r#"{"id": "a1", "command": "fly"}"#).unwrap_err();
        assert_eq!(reply.id, Some(Value::from("a1")));
        assert!(!reply.response.success);
        assert_eq!(reply.response.kind, Some(ErrorKind::PreconditionFailed));

        let reply = parse_line("not json").unwrap_err();
        assert!(reply.id.is_none());
    }

    #[test]
    fn test_reply_shape() {
        let reply = Reply {
            id: Some(Value::from(1)),
            response: CommandResponse::ok(Value::from("1,1,2")),
        };
        let json: Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], "1,1,2");
    }
}
