//! Echo server - sessions over TCP with typed and raw handlers.
//!
//! This example demonstrates:
//! - Building a `SessionServer` with the builder pattern
//! - Registering a typed handler (MESSAGE payloads) and a raw `Value` handler
//! - Pushing one-way messages back to a client from inside a handler
//!
//! # Running
//!
//! ```text
//! cargo run --example echo_server -- 127.0.0.1:7000
//! cargo run --example echo_client -- 127.0.0.1:7000
//! ```

use serde::{Deserialize, Serialize};
use sessionwire::transport::TcpAcceptor;
use sessionwire::{RpcContext, RpcFault, SessionServer, Value};
use tracing_subscriber::EnvFilter;

/// Service 1: echo.
const ECHO_SERVICE: u16 = 1;
const ECHO: u16 = 1;
const SHOUT: u16 = 2;

#[derive(Deserialize, Debug)]
struct EchoInput {
    message: String,
}

#[derive(Serialize, Debug)]
struct EchoOutput {
    echo: String,
    session: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:7000".to_string());

    let mut server = SessionServer::builder()
        .handle_typed(ECHO_SERVICE, ECHO, |input: EchoInput, ctx: RpcContext| async move {
            Ok(EchoOutput {
                echo: input.message,
                session: ctx.session_id().to_string(),
            })
        })
        .handle(ECHO_SERVICE, SHOUT, |args: Value, ctx: RpcContext| async move {
            let Some(text) = args.as_str().map(str::to_uppercase) else {
                return Err(RpcFault::bad_request("expected a string"));
            };
            // Also push it as a one-way message.
            if let Err(e) = ctx.notify(text.as_str()) {
                return Err(RpcFault::from(e));
            }
            Ok(Value::from(text))
        })
        .on_message(|value: Value, session| async move {
            tracing::info!(session_id = session.session_id(), ?value, "one-way message");
        })
        .bind(TcpAcceptor::bind(&addr).await?)?;

    tracing::info!(addr = server.local_addr(), "echo server ready");

    loop {
        tokio::select! {
            session = server.accept() => match session {
                Some(session) => {
                    tracing::info!(session_id = session.session_id(), shard = ?session.shard(), "client joined");
                    tokio::spawn(async move {
                        let reason = session.closed().await;
                        tracing::info!(session_id = session.session_id(), %reason, "client left");
                    });
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                server.shutdown();
                break;
            }
        }
    }

    Ok(())
}
