//! Handler registry and inbound dispatch.
//!
//! Handlers are keyed by `service_id * 10000 + method_id` and registered
//! once at startup; the finished dispatcher is shared read-only by every
//! session of an endpoint as `Arc<RpcDispatcher>`.
//!
//! Inbound work for one session flows through a single inbox task on the
//! application runtime. One-way messages are handled there in arrival
//! order; requests are spawned so slow handlers do not stall the inbox.
//!
//! # Example
//!
//! ```
//! use sessionwire::rpc::{RpcDispatcher, RpcFault};
//! use sessionwire::Value;
//!
//! let mut dispatcher = RpcDispatcher::new();
//! dispatcher
//!     .register(1, 1, |args: Value, _ctx| async move {
//!         match args.as_i64() {
//!             Some(n) => Ok(Value::Long(n * 2)),
//!             None => Err(RpcFault::bad_request("expected a number")),
//!         }
//!     })
//!     .unwrap();
//! assert!(dispatcher.contains(1, 1));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};

use super::context::RpcContext;
use super::invocation::{
    method_key, HandlerResult, Invocation, RpcFault, METHOD_KEY_FACTOR, METHOD_NOT_FOUND,
    SERVER_BUSY,
};
use crate::codec::Value;
use crate::config::DEFAULT_MAX_CONCURRENT_HANDLERS;
use crate::error::{Result, SessionError};
use crate::session::Session;
use crate::transport::BoxFuture;

/// An RPC method implementation.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, args: Value, ctx: RpcContext) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Value, RpcContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, args: Value, ctx: RpcContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(args, ctx))
    }
}

/// Wrapper that carries serde types as MESSAGE values.
pub struct TypedHandler<F, T, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RpcContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, RpcFault>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RpcContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, RpcFault>> + Send + 'static,
{
    fn call(&self, args: Value, ctx: RpcContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match args.decode_message() {
            Some(Ok(v)) => v,
            Some(Err(e)) => return Box::pin(async move { Err(RpcFault::from(e)) }),
            None => {
                let found = args.wire_type();
                return Box::pin(async move {
                    Err(RpcFault::bad_request(format!("expected MESSAGE argument, found {found:?}")))
                });
            }
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            match fut.await {
                Ok(reply) => Value::message(&reply).map_err(RpcFault::from),
                Err(fault) => Err(fault),
            }
        })
    }
}

/// Callback for one-way messages.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, value: Value, session: Session) -> BoxFuture<'static, ()>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Value, Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn on_message(&self, value: Value, session: Session) -> BoxFuture<'static, ()> {
        Box::pin(self(value, session))
    }
}

/// Work handed from a session worker to its inbox task.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Value),
    Request {
        request_id: u64,
        is_sync: bool,
        invocation: Invocation,
    },
}

/// Registry of RPC handlers and the one-way message callback.
pub struct RpcDispatcher {
    handlers: HashMap<u32, Arc<dyn Handler>>,
    on_message: Option<Arc<dyn MessageHandler>>,
    limit: Arc<Semaphore>,
    max_concurrent: usize,
}

impl std::fmt::Debug for RpcDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("RpcDispatcher")
            .field("handlers", &keys)
            .field("on_message", &self.on_message.is_some())
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}

impl Default for RpcDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            on_message: None,
            limit: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_HANDLERS)),
            max_concurrent: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }

    /// Register a handler for `(service_id, method_id)`.
    ///
    /// # Errors
    ///
    /// [`SessionError::DuplicateHandler`] if the key is taken,
    /// [`SessionError::InvalidConfig`] if `method_id` does not fit the key.
    pub fn register<F, Fut>(&mut self, service_id: u16, method_id: u16, handler: F) -> Result<()>
    where
        F: Fn(Value, RpcContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(service_id, method_id, handler)
    }

    /// Register any [`Handler`] implementation.
    pub fn register_handler<H: Handler>(
        &mut self,
        service_id: u16,
        method_id: u16,
        handler: H,
    ) -> Result<()> {
        if u32::from(method_id) >= METHOD_KEY_FACTOR {
            return Err(SessionError::InvalidConfig(format!(
                "method id {method_id} must be below {METHOD_KEY_FACTOR}"
            )));
        }
        let key = method_key(service_id, method_id);
        if self.handlers.contains_key(&key) {
            return Err(SessionError::DuplicateHandler {
                service_id,
                method_id,
            });
        }
        self.handlers.insert(key, Arc::new(handler));
        tracing::debug!(service_id, method_id, key, "registered RPC handler");
        Ok(())
    }

    /// Register a handler taking and returning serde types.
    pub fn register_typed<F, T, R, Fut>(&mut self, service_id: u16, method_id: u16, handler: F) -> Result<()>
    where
        F: Fn(T, RpcContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, RpcFault>> + Send + 'static,
    {
        self.register_handler(service_id, method_id, TypedHandler::new(handler))
    }

    /// Set the callback for one-way messages. Replaces any previous one.
    pub fn on_message<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Value, Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_message = Some(Arc::new(handler));
    }

    /// Cap the number of handlers running at once across all sessions.
    pub fn set_max_concurrent_handlers(&mut self, limit: usize) {
        let limit = limit.max(1);
        self.max_concurrent = limit;
        self.limit = Arc::new(Semaphore::new(limit));
    }

    pub fn max_concurrent_handlers(&self) -> usize {
        self.max_concurrent
    }

    pub fn contains(&self, service_id: u16, method_id: u16) -> bool {
        self.handler(service_id, method_id).is_some()
    }

    /// Method ids past the key factor would alias another service's key.
    fn handler(&self, service_id: u16, method_id: u16) -> Option<&Arc<dyn Handler>> {
        if u32::from(method_id) >= METHOD_KEY_FACTOR {
            return None;
        }
        self.handlers.get(&method_key(service_id, method_id))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Start the inbox task for one session.
    pub(crate) fn spawn_inbox(
        self: &Arc<Self>,
        session: Session,
        mut inbox: mpsc::UnboundedReceiver<Inbound>,
        runtime: &Handle,
    ) {
        let dispatcher = self.clone();
        let handle = runtime.clone();
        runtime.spawn(async move {
            while let Some(item) = inbox.recv().await {
                match item {
                    Inbound::Message(value) => dispatcher.deliver_message(value, &session).await,
                    Inbound::Request {
                        request_id,
                        is_sync,
                        invocation,
                    } => dispatcher.dispatch_request(request_id, is_sync, invocation, &session, &handle),
                }
            }
            tracing::trace!(session_id = %session.session_id(), "inbox drained");
        });
    }

    async fn deliver_message(&self, value: Value, session: &Session) {
        match &self.on_message {
            Some(handler) => handler.on_message(value, session.clone()).await,
            None => tracing::debug!(
                session_id = %session.session_id(),
                "one-way message dropped: no handler"
            ),
        }
    }

    fn dispatch_request(
        &self,
        request_id: u64,
        is_sync: bool,
        invocation: Invocation,
        session: &Session,
        runtime: &Handle,
    ) {
        let Invocation {
            service_id,
            method_id,
            args,
        } = invocation;

        let Some(handler) = self.handler(service_id, method_id).cloned() else {
            tracing::debug!(request_id, service_id, method_id, "method not found");
            session.respond(
                request_id,
                Err(RpcFault::new(
                    METHOD_NOT_FOUND,
                    format!("no handler for service {service_id} method {method_id}"),
                )),
            );
            return;
        };

        let permit = match self.limit.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(
                    request_id,
                    service_id,
                    method_id,
                    "handler capacity reached, answering busy"
                );
                session.respond(request_id, Err(RpcFault::new(SERVER_BUSY, "server busy")));
                return;
            }
        };

        let ctx = RpcContext::new(session.clone(), request_id, service_id, method_id, is_sync);
        let session = session.clone();
        runtime.spawn(async move {
            // Permit is held until this task completes
            let _permit = permit;
            let outcome = handler.call(args, ctx).await;
            if let Err(fault) = &outcome {
                tracing::debug!(request_id, code = fault.code, message = %fault.message, "handler failed");
            }
            session.respond(request_id, outcome);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_register_and_lookup() {
        let mut dispatcher = RpcDispatcher::new();
        dispatcher
            .register(2, 5, |args: Value, _ctx| async move { Ok(args) })
            .unwrap();
        assert!(dispatcher.contains(2, 5));
        assert!(!dispatcher.contains(5, 2));
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut dispatcher = RpcDispatcher::new();
        dispatcher
            .register(1, 1, |_: Value, _ctx| async { Ok(Value::Null) })
            .unwrap();
        let err = dispatcher
            .register(1, 1, |_: Value, _ctx| async { Ok(Value::Null) })
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::DuplicateHandler {
                service_id: 1,
                method_id: 1
            }
        ));
    }

    #[test]
    fn test_method_id_must_fit_key() {
        let mut dispatcher = RpcDispatcher::new();
        let result = dispatcher.register(1, 10_000, |_: Value, _ctx| async { Ok(Value::Null) });
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn test_oversized_method_id_does_not_alias() {
        let mut dispatcher = RpcDispatcher::new();
        dispatcher
            .register(2, 5, |args: Value, _ctx| async move { Ok(args) })
            .unwrap();
        // 1 * 10000 + 10005 folds onto the key of (2, 5).
        assert_eq!(method_key(1, 10_005), method_key(2, 5));
        assert!(dispatcher.contains(2, 5));
        assert!(!dispatcher.contains(1, 10_005));
    }

    #[test]
    fn test_concurrency_limit_setting() {
        let mut dispatcher = RpcDispatcher::new();
        assert_eq!(dispatcher.max_concurrent_handlers(), DEFAULT_MAX_CONCURRENT_HANDLERS);
        dispatcher.set_max_concurrent_handlers(0);
        assert_eq!(dispatcher.max_concurrent_handlers(), 1);
    }

    #[derive(Serialize, Deserialize)]
    struct Buy {
        item: u32,
        count: u32,
    }

    #[test]
    fn test_typed_registration() {
        let mut dispatcher = RpcDispatcher::new();
        dispatcher
            .register_typed(7, 1, |req: Buy, _ctx| async move { Ok(req.item * req.count) })
            .unwrap();
        assert!(dispatcher.contains(7, 1));
        assert!(format!("{dispatcher:?}").contains("70001"));
    }
}
