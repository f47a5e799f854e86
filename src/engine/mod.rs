//! Protocol engine seam and the in-process simulated engine

pub mod sim;
pub mod traits;

pub use sim::{SimConfig, SimEntity, SimulatedEngine};
pub use traits::{
    AemResultHandler, BeginHandler, ControlResultHandler, ControlledEntity, ControlledEntityGuard,
    EngineObserver, EntityModelVisitor, ExclusiveAccessHandler, ExclusiveAccessToken, ProtocolEngine,
};
