use std::time::Duration;

use application::{ClientEvent, OutboundReceiver, ServerEvent};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::ConnectionId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::AppState;

/// 关闭前等待剩余事件写出的最长时间
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket 连接
///
/// 负责一条连接的完整生命周期：
/// - 入站帧解析为客户端事件后交给广播引擎
/// - 引擎的出站事件序列化后写回客户端
/// - 断开时通知引擎清理会话、房间与输入状态
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
    /// 握手时通过 `?token=` 提供并已验证的令牌
    token: Option<String>,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, state: AppState, token: Option<String>) -> Self {
        Self {
            socket,
            state,
            token,
        }
    }

    /// 运行 WebSocket 连接的主循环
    pub async fn run(self) {
        let Self {
            socket,
            state,
            token,
        } = self;
        let engine = state.engine.clone();
        let connection = engine.connect();
        let connection_id = connection.id;
        tracing::info!(connection_id = %connection_id, "WebSocket 连接已建立");

        if let Some(token) = token {
            if let Err(err) = engine.identify(connection_id, &token).await {
                tracing::warn!(connection_id = %connection_id, error = %err, "握手令牌验证失败");
                engine.disconnect(connection_id).await;
                return;
            }
        }

        let (mut sender, mut incoming) = socket.split();

        // 创建 mpsc channel 来解耦对 sender 的访问
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);
        let mut outbound: OutboundReceiver = connection.outbound;

        // 发送任务：统一处理所有对 WebSocket sender 的写操作
        let mut send_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(cmd) = cmd_rx.recv() => {
                        let frame = match cmd {
                            WsCommand::SendText(text) => WsMessage::Text(text.into()),
                            WsCommand::SendPong(data) => WsMessage::Pong(data.into()),
                        };
                        if sender.send(frame).await.is_err() {
                            tracing::warn!(connection_id = %connection_id, "写入 WebSocket 失败");
                            break;
                        }
                    }
                    event = outbound.recv() => {
                        let Some(event) = event else {
                            // 引擎已释放该连接
                            let _ = sender.send(WsMessage::Close(None)).await;
                            break;
                        };
                        let payload = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(err) => {
                                tracing::warn!(error = %err, event = event.name(), "事件序列化失败");
                                continue;
                            }
                        };
                        if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                            tracing::warn!(connection_id = %connection_id, "写入 WebSocket 失败");
                            break;
                        }
                    }
                }
            }
            tracing::debug!(connection_id = %connection_id, "WebSocket发送任务结束");
        });

        // 接收任务：处理来自WebSocket客户端的消息
        let mut recv_task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(Ok(message)) = incoming.next().await {
                    if handle_incoming(&engine, connection_id, message, &cmd_tx)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                tracing::debug!(connection_id = %connection_id, "WebSocket接收任务结束");
            })
        };

        tokio::select! {
            _ = &mut send_task => {
                // 等接收任务真正停下，避免它在断开清理之后再把连接加入房间
                recv_task.abort();
                let _ = recv_task.await;
            }
            _ = &mut recv_task => {
                // 释放连接后出站通道关闭，发送任务写完剩余事件再退出
                engine.disconnect(connection_id).await;
                if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
                    send_task.abort();
                }
            }
        }

        engine.disconnect(connection_id).await;
        tracing::info!(connection_id = %connection_id, "WebSocket连接已断开");
    }
}

/// 处理来自客户端的帧，返回 `Err` 表示需要关闭连接
async fn handle_incoming(
    engine: &application::BroadcastEngine,
    connection_id: ConnectionId,
    message: WsMessage,
    cmd_tx: &mpsc::Sender<WsCommand>,
) -> Result<(), ()> {
    match message {
        WsMessage::Close(_) => {
            tracing::info!(connection_id = %connection_id, "WebSocket收到关闭消息");
            return Err(());
        }
        WsMessage::Ping(data) => {
            if cmd_tx
                .send(WsCommand::SendPong(data.to_vec()))
                .await
                .is_err()
            {
                return Err(());
            }
        }
        WsMessage::Pong(_) => {}
        WsMessage::Text(text) => {
            let event = match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(event) => event,
                Err(err) => {
                    tracing::debug!(connection_id = %connection_id, error = %err, "无法解析的客户端事件");
                    return reply(cmd_tx, &ServerEvent::error("invalid event payload")).await;
                }
            };
            if engine.handle(connection_id, event).await.is_err() {
                return Err(());
            }
        }
        WsMessage::Binary(_) => {
            return reply(cmd_tx, &ServerEvent::error("binary frames are not supported")).await;
        }
    }
    Ok(())
}

async fn reply(cmd_tx: &mpsc::Sender<WsCommand>, event: &ServerEvent) -> Result<(), ()> {
    let payload = serde_json::to_string(event).map_err(|_| ())?;
    cmd_tx
        .send(WsCommand::SendText(payload))
        .await
        .map_err(|_| ())
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendText(String),
    SendPong(Vec<u8>),
}
