//! Per-request context handed to RPC handlers.

use crate::codec::Value;
use crate::error::Result;
use crate::session::Session;

/// What a handler knows about the request it is serving.
///
/// The context holds a handle to the calling session, so a handler can
/// push one-way messages or issue calls of its own back to the peer.
#[derive(Debug, Clone)]
pub struct RpcContext {
    session: Session,
    request_id: u64,
    service_id: u16,
    method_id: u16,
    is_sync: bool,
}

impl RpcContext {
    pub(crate) fn new(
        session: Session,
        request_id: u64,
        service_id: u16,
        method_id: u16,
        is_sync: bool,
    ) -> Self {
        Self {
            session,
            request_id,
            service_id,
            method_id,
            is_sync,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn service_id(&self) -> u16 {
        self.service_id
    }

    pub fn method_id(&self) -> u16 {
        self.method_id
    }

    /// Whether the caller is blocked waiting on this response.
    pub fn is_sync(&self) -> bool {
        self.is_sync
    }

    /// Send a one-way message to the caller's side.
    pub fn notify(&self, value: impl Into<Value>) -> Result<()> {
        self.session.send(value)
    }
}
