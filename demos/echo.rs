//! Echo service - a provider and a consumer in one process.
//!
//! Starts a server with a single `hello.echo` operation on an ephemeral
//! port, calls it a few times through the client, and shuts down.
//!
//! ```text
//! RUST_LOG=highway_transport=debug cargo run --example echo
//! ```

use std::sync::Arc;

use highway_transport::client::{HighwayClient, Invocation};
use highway_transport::codec::OperationSchema;
use highway_transport::server::{HighwayServer, InvokeOutcome};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let echo = OperationSchema::new("hello", "echo").param("message");

    let server = HighwayServer::builder()
        .listen_address("127.0.0.1:0")
        .operation(echo.clone(), |header, mut args| async move {
            let message = args.pop().unwrap_or(Value::Null);
            InvokeOutcome::ok(json!({
                "echo": message,
                "service": header.dest_microservice,
            }))
        })
        .build()?;
    let handle = server.bind().await?;
    let endpoint = handle.endpoint();
    println!("Listening on {}", endpoint);

    let client = HighwayClient::builder().build()?;
    let echo = Arc::new(echo);

    for message in ["hello", "world"] {
        let response = client
            .send(
                &endpoint,
                Invocation::new("demo", echo.clone(), vec![json!(message)])
                    .with_context("caller", "echo-demo"),
            )
            .await?;
        println!("{} -> {}", message, response.value);
    }

    client.close();
    handle.shutdown().await;
    Ok(())
}
