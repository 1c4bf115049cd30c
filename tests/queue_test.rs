use std::sync::Arc;
use std::time::Duration;

use fast_servicebus_broker::entity::QueueOptions;
use fast_servicebus_broker::message::Message;
use fast_servicebus_broker::store::SettlementOutcome;
use fast_servicebus_broker::{Error, Namespace, Router};

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

async fn router_with_queue(name: &str, options: QueueOptions) -> Router {
    init_tracing();
    let ns = Arc::new(Namespace::new());
    ns.create_queue(name, options).await.unwrap();
    Router::new(ns)
}

fn test_message(body: &str) -> Message {
    Message::builder().body(body.to_string()).build()
}

#[tokio::test]
async fn test_send_receive_complete() {
    let router = router_with_queue("orders", QueueOptions::default()).await;

    router.send("orders", test_message("order-1")).await.unwrap();
    router.send("orders", test_message("order-2")).await.unwrap();

    let batch = router.receive("orders", 10).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(&batch[0].message.body[..], b"order-1");
    assert_eq!(&batch[1].message.body[..], b"order-2");

    for envelope in &batch {
        router
            .complete("orders", envelope.lock_token().unwrap())
            .await
            .unwrap();
    }
    let counts = router.counts("orders").await.unwrap();
    assert_eq!(counts.active + counts.locked, 0);
}

#[tokio::test]
async fn test_locked_message_invisible_until_settled() {
    let router = router_with_queue("q", QueueOptions::default()).await;
    router.send("q", test_message("only")).await.unwrap();

    let first = router.receive("q", 1).await.unwrap();
    assert_eq!(first.len(), 1);

    // A competing receive while locked sees nothing.
    assert!(router.receive("q", 1).await.unwrap().is_empty());

    // Peek still sees it without disturbing the lock.
    let peeked = router.peek("q", 10).await.unwrap();
    assert_eq!(peeked.len(), 1);

    router
        .complete("q", first[0].lock_token().unwrap())
        .await
        .unwrap();
    assert!(router.peek("q", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_abandon_increments_delivery_count_until_dlq() {
    let router = router_with_queue(
        "q",
        QueueOptions {
            max_delivery_count: 3,
            ..Default::default()
        },
    )
    .await;
    router.send("q", test_message("retry-me")).await.unwrap();

    for expected_count in 1..3 {
        let batch = router.receive("q", 1).await.unwrap();
        assert_eq!(batch[0].delivery_count, expected_count);
        let outcome = router
            .abandon("q", batch[0].lock_token().unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, SettlementOutcome::Abandoned);
    }

    // Third delivery reaches the maximum; that abandon dead-letters.
    let batch = router.receive("q", 1).await.unwrap();
    assert_eq!(batch[0].delivery_count, 3);
    let outcome = router
        .abandon("q", batch[0].lock_token().unwrap())
        .await
        .unwrap();
    assert_eq!(outcome, SettlementOutcome::DeadLettered);

    let counts = router.counts("q").await.unwrap();
    assert_eq!(counts.active, 0);
    assert_eq!(counts.dead_letter, 1);

    let dead = router.peek_dead_letter("q", 1).await.unwrap();
    assert_eq!(
        dead[0].dead_letter_reason.as_deref(),
        Some("MaxDeliveryCountExceeded")
    );
}

#[tokio::test]
async fn test_defer_round_trip() {
    let router = router_with_queue("q", QueueOptions::default()).await;
    router.send("q", test_message("later")).await.unwrap();

    let batch = router.receive("q", 1).await.unwrap();
    let seq = router
        .defer("q", batch[0].lock_token().unwrap())
        .await
        .unwrap();

    assert!(router.receive("q", 10).await.unwrap().is_empty());
    assert_eq!(router.counts("q").await.unwrap().deferred, 1);

    let envelope = router.receive_deferred("q", seq).await.unwrap();
    assert_eq!(&envelope.message.body[..], b"later");
    router
        .complete("q", envelope.lock_token().unwrap())
        .await
        .unwrap();
    assert_eq!(router.counts("q").await.unwrap().deferred, 0);
}

#[tokio::test]
async fn test_receive_deferred_wrong_sequence() {
    let router = router_with_queue("q", QueueOptions::default()).await;
    assert!(matches!(
        router.receive_deferred("q", 42).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_expired_lock_redelivery_via_sweeper() {
    init_tracing();
    let ns = Arc::new(Namespace::new());
    ns.create_queue(
        "q",
        QueueOptions {
            lock_duration: Duration::from_millis(40),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let router = Router::new(ns.clone());
    let sweeper = ns.spawn_expiry_sweeper(Duration::from_millis(20));

    router.send("q", test_message("sticky")).await.unwrap();
    let token = router.receive("q", 1).await.unwrap()[0]
        .lock_token()
        .unwrap();

    // The sweeper releases the lock without any further receive call.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(router.counts("q").await.unwrap().active, 1);

    // The old consumer's settlement now fails.
    assert!(matches!(
        router.complete("q", token).await,
        Err(Error::LockLost(_))
    ));

    let batch = router.receive("q", 1).await.unwrap();
    assert_eq!(batch[0].delivery_count, 2);

    sweeper.abort();
}

#[tokio::test]
async fn test_queue_deleted_mid_flight() {
    let router = router_with_queue("q", QueueOptions::default()).await;
    router.send("q", test_message("doomed")).await.unwrap();

    router.namespace().delete_queue("q").await.unwrap();
    assert!(matches!(
        router.receive("q", 1).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        router.send("q", test_message("late")).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_ttl_expiry_to_dlq_end_to_end() {
    let router = router_with_queue(
        "q",
        QueueOptions {
            default_message_ttl: Some(Duration::from_millis(40)),
            dead_lettering_on_message_expiration: true,
            ..Default::default()
        },
    )
    .await;
    router.send("q", test_message("ephemeral")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    // The receive path purges TTL-expired messages before locking.
    assert!(router.receive("q", 1).await.unwrap().is_empty());

    let dead = router.peek_dead_letter("q", 1).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0].dead_letter_reason.as_deref(),
        Some("TTLExpiredException")
    );
}

#[tokio::test]
async fn test_lock_tokens_unique_across_redeliveries() {
    let router = router_with_queue(
        "q",
        QueueOptions {
            max_delivery_count: 100,
            ..Default::default()
        },
    )
    .await;
    router.send("q", test_message("again")).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..5 {
        let batch = router.receive("q", 1).await.unwrap();
        let token = batch[0].lock_token().unwrap();
        assert!(!seen.contains(&token), "lock tokens must never repeat");
        seen.push(token);
        router.abandon("q", token).await.unwrap();
    }
}
