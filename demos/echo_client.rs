//! Echo client - connects to `echo_server` and exercises each call style.
//!
//! ```text
//! cargo run --example echo_client -- 127.0.0.1:7000
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sessionwire::transport::TcpConnector;
use sessionwire::{SessionClient, Value};
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Debug)]
struct EchoInput {
    message: String,
}

#[derive(Deserialize, Debug)]
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

    let session = SessionClient::builder()
        .client_identity(1)
        .on_message(|value: Value, _session| async move {
            tracing::info!(?value, "pushed by server");
        })
        .connect(TcpConnector::new(addr))
        .await?;
    tracing::info!(session_id = session.session_id(), "connected");

    let reply: EchoOutput = session
        .call_typed(1, 1, &EchoInput {
            message: "hello".to_string(),
        })
        .await?;
    tracing::info!(echo = %reply.echo, server_session = %reply.session, "typed call");

    let shouted = session.call(1, 2, "quiet please").await?;
    tracing::info!(?shouted, "raw call");

    session.call_then(1, 2, "callback", |result| {
        tracing::info!(?result, "callback call");
    })?;

    let blocking = session.clone();
    let value = tokio::task::spawn_blocking(move || blocking.call_blocking(1, 2, "blocking")).await??;
    tracing::info!(?value, "blocking call");

    session.send("bye")?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = session.stats().await?;
    tracing::info!(?stats, "final stats");
    session.close();
    session.closed().await;
    Ok(())
}
