//! Network Layer
//!
//! WebSocket server for real-time multiplayer card tables.
//! Game rules live in `game/`; this layer owns locking, fanout and I/O.
//!
//! ## Module Structure
//!
//! - `protocol`: Envelope and message types
//! - `session`: Session store (all tables, one lock)
//! - `hub`: Connection registry and broadcast fanout
//! - `router`: Client action dispatch
//! - `server`: Accept loop, connection tasks and configuration

pub mod hub;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;

pub use hub::{ClientIdentity, ConnectionId, Hub, HubError, Outbound};
pub use protocol::{
    ClientMessage, Envelope, ErrorCode, GameSummary, ProtocolError, ServerError, ServerMessage,
};
pub use router::{MessageRouter, RouteError};
pub use server::{ConfigError, GameServer, GameServerError, ServerConfig};
pub use session::{SessionError, SessionManager, SessionTxn};
