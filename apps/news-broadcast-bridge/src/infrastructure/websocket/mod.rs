//! Client-facing WebSocket server.
//!
//! Each upgraded socket registers itself with the
//! [`ClientRegistry`](crate::infrastructure::broadcast::ClientRegistry) and
//! drains its outbound queue until either side closes.

mod server;

pub use server::{
    ApiResponse, STATUS_PATH, StreamServer, StreamServerError, StreamServerState, StreamStatus,
    WS_PATH, router,
};
