mod broadcast_engine;

pub use broadcast_engine::{
    BroadcastEngine, BroadcastEngineDependencies, EngineConnection, EngineSettings, JoinReply,
    RoomPage, SendMessageRequest, StoreHealth,
};
