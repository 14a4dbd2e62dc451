#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{
    BroadcastEngine, BroadcastEngineDependencies, ContentPolicy, EngineSettings, SystemClock,
};
use config::JwtConfig;
use domain::{UserId, UserIdentity};
use futures_util::{SinkExt, StreamExt};
use infrastructure::{InMemoryStore, JwtIdentityProvider};
use serde_json::Value;
use tokio::{net::TcpListener, net::TcpStream, sync::oneshot};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;
use web_api::{router, AppState};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: Arc<JwtIdentityProvider>,
    pub engine: BroadcastEngine,
    pub store: InMemoryStore,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let jwt = Arc::new(JwtIdentityProvider::new(&JwtConfig {
            secret: "integration-test-secret-with-enough-length".to_string(),
            expiration_hours: 1,
        }));
        let store = InMemoryStore::new();
        let engine = BroadcastEngine::new(BroadcastEngineDependencies {
            store: Arc::new(store.clone()),
            identity_provider: jwt.clone(),
            policy: ContentPolicy::new(["spam"], Some(1000)).expect("policy"),
            clock: Arc::new(SystemClock),
            settings: EngineSettings::default(),
        });
        engine.spawn_typing_sweeper();

        let app = router(AppState::new(engine.clone(), jwt.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            jwt,
            engine,
            store,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/ws?token={}", self.addr, token),
            None => format!("ws://{}/ws", self.addr),
        }
    }

    /// 签发一个新用户的令牌
    pub fn token_for(&self, name: &str) -> (UserIdentity, String) {
        let identity = UserIdentity::new(UserId::from(Uuid::new_v4()), name, None);
        let token = self.jwt.issue_token(&identity).expect("token");
        (identity, token)
    }

    pub async fn connect(&self, token: Option<&str>) -> WsClient {
        let (ws, _) = connect_async(self.ws_url(token)).await.expect("ws connect");
        ws
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.engine.shutdown();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub async fn send_event(ws: &mut WsClient, event: Value) {
    ws.send(TungsteniteMessage::Text(event.to_string().into()))
        .await
        .expect("ws send");
}

/// 读取下一条事件；连接关闭时返回 `None`
pub async fn next_event(ws: &mut WsClient) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for websocket frame");
        match frame {
            Some(Ok(TungsteniteMessage::Text(payload))) => {
                return Some(serde_json::from_str(payload.as_str()).expect("event json"));
            }
            Some(Ok(TungsteniteMessage::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// 跳过其他事件，直到收到指定名称的事件
pub async fn next_named(ws: &mut WsClient, name: &str) -> Value {
    loop {
        let event = next_event(ws).await.expect("connection closed");
        if event["event"] == name {
            return event;
        }
    }
}
