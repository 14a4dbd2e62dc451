use std::sync::Arc;

use application::{BroadcastEngine, IdentityProvider};

#[derive(Clone)]
pub struct AppState {
    pub engine: BroadcastEngine,
    /// HTTP 接口和 WebSocket 握手共用的身份验证
    pub identity_provider: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(engine: BroadcastEngine, identity_provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            engine,
            identity_provider,
        }
    }
}
