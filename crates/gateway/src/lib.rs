//! HTTP gateway: session coordination, event fan-out and the axum surface
//! that exposes both.

mod broadcast;
mod coordinator;
mod errors;
mod http;

pub use broadcast::{BroadcastSettings, StreamBroadcaster, Subscription};
pub use coordinator::{
    Attachment, CoordinatorSettings, PurgeReport, SessionCoordinator, TurnHandle, TurnRequest,
    TurnResult,
};
pub use errors::GatewayError;
pub use http::{PRINCIPAL_HEADER, RUN_ID_HEADER, router, serve};
