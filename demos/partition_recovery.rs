//! Partition recovery example.
//!
//! This example sends to two partitions through an in-memory broker,
//! then injects a forced detach and a dropped connection and shows the
//! registry recovering from each.
//!
//! Run: cargo run --example partition_recovery
//! Set RUST_LOG=hublink=debug to see every recovery step.

use std::sync::Arc;
use std::time::Duration;

use hublink::connection::{ClientOptions, Namespace, RetryOptions};
use hublink::credential::{AccessToken, StaticTokenCredential};
use hublink::links::Links;
use hublink::transport::memory::MemoryBroker;
use hublink::transport::{SenderLink, SenderPtr};
use hublink::{Condition, Message, PartitionKey};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const HUB: &str = "telemetry";

async fn send(
    senders: &Links<SenderPtr>,
    cancel: &CancellationToken,
    partition: &PartitionKey,
    body: &str,
) -> hublink::Result<()> {
    let options = RetryOptions::default().with_retry_delay(Duration::from_millis(100));
    senders
        .retry(cancel, partition, "send", &options, |handle| {
            let cancel = cancel.clone();
            let message = Message::new(body.as_bytes().to_vec());
            async move {
                println!(
                    "  sending {body:?} on {} (connection {})",
                    handle.name(),
                    handle.version()
                );
                handle.link().send(&cancel, message).await
            }
        })
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let broker = MemoryBroker::new();
    let ns = Arc::new(Namespace::new(
        broker.clone(),
        StaticTokenCredential::new(AccessToken::sas("SharedAccessSignature sr=telemetry")),
        ClientOptions::new("demo.servicebus.windows.net"),
    ));
    let senders = Links::senders(ns.clone(), HUB);
    let cancel = CancellationToken::new();
    let p0 = PartitionKey::new("0");
    let p1 = PartitionKey::new("1");

    println!("--- Example 1: First use creates the links ---");
    send(&senders, &cancel, &p0, "reading-1").await?;
    send(&senders, &cancel, &p1, "reading-2").await?;

    println!("\n--- Example 2: Forced detach on partition 0 ---");
    let handle = senders.get_link(&cancel, &p0).await?;
    broker.detach_link(handle.name(), Some(Condition::DETACH_FORCED));
    send(&senders, &cancel, &p0, "reading-3").await?;
    send(&senders, &cancel, &p1, "reading-4").await?;

    println!("\n--- Example 3: Dropped connection ---");
    broker.drop_connection();
    send(&senders, &cancel, &p1, "reading-5").await?;
    send(&senders, &cancel, &p0, "reading-6").await?;

    let stats = ns.stats();
    println!("\nconnections created: {}", stats.connections_created);
    println!("connection recoveries: {}", stats.recoveries);
    println!("claims negotiated: {}", stats.claims_negotiated);
    for partition in [&p0, &p1] {
        let address = format!("{HUB}/Partitions/{partition}");
        println!("queued on {address}: {}", broker.queued(&address));
    }

    senders.close(&cancel).await?;
    ns.close(&cancel, true).await?;
    Ok(())
}
