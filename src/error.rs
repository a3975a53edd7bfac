use std::net::SocketAddr;

use crate::relay::{ConnectionId, ServerState};

/// Failures that stop the relay's accept loop.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept connection")]
    Accept(#[source] std::io::Error),

    #[error("identity allocator yielded reserved identity {0}")]
    ReservedIdentity(ConnectionId),

    #[error("relay cannot start while {0:?}")]
    NotStartable(ServerState),
}
