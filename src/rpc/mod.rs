//! RPC layer: request/response correlation and handler dispatch.
//!
//! - [`RpcDispatcher`] - handlers keyed by `(service_id, method_id)`
//! - [`RpcContext`] - what a handler sees of its request
//! - [`PendingCalls`] - outstanding calls with deadlines, owned by a session
//! - [`Invocation`] - request payload layout

mod context;
mod dispatcher;
mod invocation;
mod pending;

pub use context::RpcContext;
pub use dispatcher::{Handler, MessageHandler, RpcDispatcher, TypedHandler};
pub(crate) use dispatcher::Inbound;
pub use invocation::{
    decode_outcome, encode_outcome, method_key, HandlerResult, Invocation, RpcFault, BAD_REQUEST,
    HANDLER_ERROR, METHOD_KEY_FACTOR, METHOD_NOT_FOUND, OK, SERVER_BUSY,
};
pub use pending::{next_request_id, PendingCalls, Reply, ReplyCallback};
