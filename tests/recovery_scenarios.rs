//! End-to-end recovery scenarios against the in-memory broker.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hublink::connection::{ClientOptions, Namespace, RetryOptions};
use hublink::credential::{AccessToken, StaticTokenCredential};
use hublink::links::Links;
use hublink::transport::memory::MemoryBroker;
use hublink::transport::{ReceiverLink, ReceiverPtr, SenderLink, SenderPtr};
use hublink::{Condition, ConnectionVersion, HubError, Message, PartitionKey};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const HUB: &str = "telemetry";

fn namespace(broker: &MemoryBroker) -> Arc<Namespace> {
    let options = ClientOptions::new("ns.example").with_close_timeout(Duration::from_secs(5));
    Arc::new(Namespace::new(
        broker.clone(),
        StaticTokenCredential::new(AccessToken::sas("SharedAccessSignature sr=telemetry")),
        options,
    ))
}

fn fast_retry(max_retries: i32) -> RetryOptions {
    RetryOptions::default()
        .with_max_retries(max_retries)
        .with_retry_delay(Duration::from_millis(50))
        .with_max_retry_delay(Duration::from_millis(200))
}

fn pid(id: &str) -> PartitionKey {
    PartitionKey::new(id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_get_link_creates_one_link_per_key() {
    let broker = MemoryBroker::new();
    let senders: Arc<Links<SenderPtr>> = Arc::new(Links::senders(namespace(&broker), HUB));

    let mut tasks = Vec::new();
    for i in 0..32 {
        let senders = senders.clone();
        tasks.push(tokio::spawn(async move {
            let key = pid(&(i % 4).to_string());
            let handle = senders.get_link(&CancellationToken::new(), &key).await.unwrap();
            (key, handle.name().to_owned())
        }));
    }

    let mut names = HashSet::new();
    for task in tasks {
        names.insert(task.await.unwrap());
    }
    assert_eq!(names.len(), 4);
    assert_eq!(broker.open_links().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_forced_detach_recreates_one_link() {
    let broker = MemoryBroker::new();
    let senders = Links::senders(namespace(&broker), HUB);
    let cancel = CancellationToken::new();

    let original = senders.get_link(&cancel, &pid("0")).await.unwrap();
    let untouched = senders.get_link(&cancel, &pid("1")).await.unwrap();
    broker.detach_link(original.name(), Some(Condition::DETACH_FORCED));

    let used = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();
    senders
        .retry(&cancel, &pid("0"), "send", &fast_retry(3), |handle| {
            let cancel = cancel.clone();
            let used = used.clone();
            async move {
                used.lock().unwrap().push(handle.name().to_owned());
                handle.link().send(&cancel, Message::new(b"reading".as_slice())).await
            }
        })
        .await
        .unwrap();

    let used = used.lock().unwrap().clone();
    assert_eq!(used.len(), 2);
    assert_eq!(used[0], original.name());
    assert_ne!(used[1], original.name());
    // the quick retry doesn't back off
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(broker.queued("telemetry/Partitions/0"), 1);

    let mut open = broker.open_links();
    open.sort();
    let mut expected = vec![used[1].clone(), untouched.name().to_owned()];
    expected.sort();
    assert_eq!(open, expected);
}

#[tokio::test(start_paused = true)]
async fn test_quick_retry_is_used_once_per_call() {
    let broker = MemoryBroker::new();
    let senders = Links::senders(namespace(&broker), HUB);
    let cancel = CancellationToken::new();

    let calls = Arc::new(Mutex::new(0u32));
    let err = senders
        .retry(&cancel, &pid("0"), "send", &fast_retry(1), |handle| {
            let cancel = cancel.clone();
            let calls = calls.clone();
            let broker = broker.clone();
            async move {
                *calls.lock().unwrap() += 1;
                // every link dies right before it is used
                broker.detach_link(handle.name(), Some(Condition::DETACH_FORCED));
                handle.link().send(&cancel, Message::default()).await
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, HubError::Detached { .. }));
    // first attempt, its quick retry, then the single budgeted retry
    assert_eq!(*calls.lock().unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connection_error_recreates_connection_once() {
    let broker = MemoryBroker::new();
    let ns = namespace(&broker);
    let senders = Links::senders(ns.clone(), HUB);
    let cancel = CancellationToken::new();

    senders.get_link(&cancel, &pid("0")).await.unwrap();
    senders.get_link(&cancel, &pid("1")).await.unwrap();
    broker.drop_connection();

    let versions = Arc::new(Mutex::new(Vec::new()));
    senders
        .retry(&cancel, &pid("0"), "send", &fast_retry(3), |handle| {
            let cancel = cancel.clone();
            let versions = versions.clone();
            async move {
                versions.lock().unwrap().push(handle.version());
                handle.link().send(&cancel, Message::default()).await
            }
        })
        .await
        .unwrap();

    assert_eq!(
        *versions.lock().unwrap(),
        vec![ConnectionVersion(1), ConnectionVersion(2)]
    );
    assert_eq!(ns.version().await, ConnectionVersion(2));
    assert_eq!(broker.stats().connections_opened, 2);
    // partition 1 was evicted with the old connection and not recreated yet
    assert_eq!(senders.partitions().await, vec![pid("0")]);
    assert_eq!(ns.stats().recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_stops_immediately() {
    let broker = MemoryBroker::new();
    broker.set_cbs_status(401, "InvalidSignature");
    let ns = namespace(&broker);
    let senders = Links::senders(ns.clone(), HUB);
    let cancel = CancellationToken::new();

    let calls = Arc::new(Mutex::new(0u32));
    let started = Instant::now();
    let err = senders
        .retry(&cancel, &pid("0"), "send", &fast_retry(5), |_handle| {
            let calls = calls.clone();
            async move {
                *calls.lock().unwrap() += 1;
                Ok(())
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, HubError::Auth { status_code: 401, .. }));
    assert_eq!(*calls.lock().unwrap(), 0);
    assert_eq!(ns.stats().claim_failures, 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_link_close_keeps_connection() {
    let broker = MemoryBroker::new();
    let ns = namespace(&broker);
    let senders = Links::senders(ns.clone(), HUB);
    let cancel = CancellationToken::new();

    senders.get_link(&cancel, &pid("0")).await.unwrap();
    broker.set_close_delay(Duration::from_secs(4));

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = senders
        .retry(&cancel, &pid("0"), "send", &fast_retry(3), |handle| async move {
            Err::<(), _>(HubError::LinkClosed(handle.name().to_owned()))
        })
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(ns.version().await, ConnectionVersion(1));
    assert!(senders.partitions().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_link_recovery_delay_replaces_backoff() {
    let broker = MemoryBroker::new();
    let senders = Links::senders(namespace(&broker), HUB);
    let cancel = CancellationToken::new();
    let options = fast_retry(3).with_link_recovery_delay(Duration::from_secs(7));

    let calls = Arc::new(Mutex::new(0u32));
    let started = Instant::now();
    senders
        .retry(&cancel, &pid("0"), "send", &options, |handle| {
            let calls = calls.clone();
            async move {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                if *calls == 1 {
                    Err(HubError::LinkClosed(handle.name().to_owned()))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(7));
    assert!(elapsed < Duration::from_secs(8));
}

#[tokio::test]
async fn test_recovery_by_another_registry_evicts_own_stale_link() {
    let broker = MemoryBroker::new();
    let ns = namespace(&broker);
    let senders = Links::senders(ns.clone(), HUB);
    let receivers: Links<ReceiverPtr> = Links::receivers(ns.clone(), HUB, "$Default");
    let cancel = CancellationToken::new();

    let sender = senders.get_link(&cancel, &pid("0")).await.unwrap();
    let receiver = receivers.get_link(&cancel, &pid("0")).await.unwrap();
    broker.drop_connection();

    // the sender side notices first and replaces the connection
    let err = sender.link().send(&cancel, Message::default()).await.unwrap_err();
    senders.recover_if_needed(&cancel, Some(&sender), &err).await.unwrap();
    assert_eq!(ns.version().await, ConnectionVersion(2));

    // the receiver's link still sits on the dead connection
    let err = receiver.link().receive(&cancel).await.unwrap_err();
    receivers.recover_if_needed(&cancel, Some(&receiver), &err).await.unwrap();
    assert!(receivers.partitions().await.is_empty());

    let fresh = receivers.get_link(&cancel, &pid("0")).await.unwrap();
    assert_eq!(fresh.version(), ConnectionVersion(2));
    assert_eq!(broker.stats().connections_opened, 2);
}

#[tokio::test]
async fn test_receive_through_registry() {
    let broker = MemoryBroker::new();
    let receivers = Links::receivers(namespace(&broker), HUB, "$Default");
    let cancel = CancellationToken::new();
    broker.push(
        "telemetry/ConsumerGroups/$Default/Partitions/0",
        Message::new(b"event".as_slice()),
    );

    let message = receivers
        .retry(&cancel, &pid("0"), "receive", &fast_retry(3), |handle| {
            let cancel = cancel.clone();
            async move { handle.link().receive(&cancel).await }
        })
        .await
        .unwrap();

    assert_eq!(message.body.as_ref(), b"event");
}
