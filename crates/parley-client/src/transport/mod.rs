//! Relay transport: shared, self-healing websocket connections.

pub mod auth;
pub mod backoff;
pub mod connection;
pub mod manager;
pub mod socket;

#[cfg(test)]
pub(crate) mod mock;

pub use auth::{AuthMode, ConnectRequest, StaticToken, TokenProvider};
pub use backoff::Backoff;
pub use connection::{
    Connection, ConnectionKey, ConnectionListener, ConnectionState, ConnectionStatus,
};
pub use manager::{ConnectionManager, ConnectionTarget, Subscription};
pub use socket::{Connector, WsConnector};
