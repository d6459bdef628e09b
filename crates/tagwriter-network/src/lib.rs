//! Network layer for tagwriter.
//!
//! This crate exposes the write orchestration over HTTP and WebSocket, and
//! provides the polling agent of the cloud topology.
//!
//! # Components
//!
//! - **api**: axum router for local writes, queued commands and agent callbacks
//! - **fanout**: realtime fan-out of hub, session and command events
//! - **ws**: `/ws` endpoint streaming fan-out frames to browsers
//! - **agent**: claim-write-report loop, against a remote backend or the local queue
//! - **server**: HTTP server with the expiry sweeper
//!
//! # Topologies
//!
//! ```text
//! local:  Browser ──HTTP/WS──► Backend (hub + coordinator + queue + in-process agent)
//!
//! cloud:  Browser ──HTTP/WS──► Backend (queue) ◄──claim/stage/report── Agent (hub + coordinator)
//! ```

pub mod agent;
pub mod api;
pub mod fanout;
pub mod server;
pub mod sweeper;
pub mod ws;

pub use agent::{
    Agent, AgentConfig, AgentError, CommandSource, HttpCommandSource, LocalCommandSource,
};
pub use api::{ApiError, AppState, router};
pub use fanout::{ClientSubscription, FanoutHub, Frame, Snapshot};
pub use server::{ServerConfig, ServerError, serve, serve_on};
pub use sweeper::{spawn_expiry_sweeper, sweep_once};
