use std::sync::{Arc, Mutex};
use std::time::Duration;

use rstest::rstest;

use valkey_pubsub::{
    ChannelKind, Client, ClientConfig, DeliveryMode, ErrorKind, Node, SubscriptionSet,
};
use valkey_pubsub_test::MockBroker;

fn fast_config() -> ClientConfig {
    ClientConfig {
        reconciliation_interval: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}

fn cluster_config() -> ClientConfig {
    ClientConfig {
        cluster_mode: true,
        ..fast_config()
    }
}

/// Polls `predicate` until it holds or one second elapses.
async fn eventually(mut predicate: impl FnMut() -> bool) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition did not hold within the deadline");
}

#[rstest]
#[case::exact(ChannelKind::Exact, "news")]
#[case::pattern(ChannelKind::Pattern, "news.*")]
#[tokio::test]
async fn blocking_subscribe_confirms_and_receives(
    #[case] kind: ChannelKind,
    #[case] channel: &str,
) {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();

    client
        .subscribe_blocking([channel], kind, 1000)
        .await
        .unwrap();
    let snapshot = client.subscriptions();
    assert!(snapshot.actual[&kind].contains(channel.as_bytes()));

    // An exact subscription to "news" must not see "news.tech".
    if kind == ChannelKind::Exact {
        assert_eq!(broker.publish(b"news.tech", b"payload"), 0);
        assert_eq!(broker.publish(b"news", b"payload"), 1);
    } else {
        assert_eq!(broker.publish(b"news.tech", b"payload"), 1);
    }

    let message = client.queue().unwrap().wait_for_message().await.unwrap();
    assert_eq!(message.payload, b"payload");
    if kind == ChannelKind::Pattern {
        assert_eq!(message.pattern.as_deref(), Some(&b"news.*"[..]));
        assert_eq!(message.channel, b"news.tech");
    }
}

#[tokio::test]
async fn lazy_subscribe_converges_through_background_reconciliation() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();

    client.subscribe(["lazy"], ChannelKind::Exact).await.unwrap();
    // Intent is visible immediately, confirmation follows.
    assert!(client.subscriptions().desired[&ChannelKind::Exact].contains(&b"lazy".to_vec()));
    eventually(|| {
        client
            .subscriptions()
            .actual
            .get(&ChannelKind::Exact)
            .is_some_and(|set| set.contains(&b"lazy".to_vec()))
    })
    .await;
}

#[tokio::test]
async fn overlapping_exact_and_pattern_subscriptions_deliver_twice() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();

    client
        .subscribe_blocking(["news.tech"], ChannelKind::Exact, 1000)
        .await
        .unwrap();
    client
        .subscribe_blocking(["news.*"], ChannelKind::Pattern, 1000)
        .await
        .unwrap();

    assert_eq!(broker.publish(b"news.tech", b"story"), 2);
    let queue = client.queue().unwrap();
    let first = queue.wait_for_message().await.unwrap();
    let second = queue.wait_for_message().await.unwrap();
    // One delivery per matching subscription, distinguishable by pattern.
    assert_ne!(first.pattern.is_some(), second.pattern.is_some());
    assert_eq!(first.payload, b"story");
    assert_eq!(second.payload, b"story");
}

#[tokio::test]
async fn messages_from_one_publisher_arrive_in_order() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();
    client
        .subscribe_blocking(["seq"], ChannelKind::Exact, 1000)
        .await
        .unwrap();

    for i in 0..10u8 {
        broker.publish(b"seq", &[i]);
    }
    let queue = client.queue().unwrap();
    for i in 0..10u8 {
        let message = queue.wait_for_message().await.unwrap();
        assert_eq!(message.payload, [i]);
    }
}

#[tokio::test]
async fn two_publishers_are_observed_in_per_publisher_order() {
    let broker = MockBroker::standalone();
    let subscriber = Client::new(broker.connect(), fast_config()).unwrap();
    let alice = Client::new(broker.connect(), fast_config()).unwrap();
    let bob = Client::new(broker.connect(), fast_config()).unwrap();
    subscriber
        .subscribe_blocking(["shared"], ChannelKind::Exact, 1000)
        .await
        .unwrap();

    for i in 0..5u8 {
        alice.publish("shared", vec![b'a', i], false).await.unwrap();
        bob.publish("shared", vec![b'b', i], false).await.unwrap();
    }

    let queue = subscriber.queue().unwrap();
    let mut from_alice = Vec::new();
    let mut from_bob = Vec::new();
    for _ in 0..10 {
        let message = queue.wait_for_message().await.unwrap();
        match message.payload[0] {
            b'a' => from_alice.push(message.payload[1]),
            b'b' => from_bob.push(message.payload[1]),
            other => panic!("unexpected payload marker {other}"),
        }
    }
    assert_eq!(from_alice, vec![0, 1, 2, 3, 4]);
    assert_eq!(from_bob, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn unsubscribed_channel_stops_delivering() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();
    client
        .subscribe_blocking(["a", "b", "c"], ChannelKind::Exact, 1000)
        .await
        .unwrap();
    client
        .unsubscribe_blocking(Some(vec![b"b".to_vec()]), ChannelKind::Exact, 1000)
        .await
        .unwrap();

    assert_eq!(broker.publish(b"a", b"1"), 1);
    assert_eq!(broker.publish(b"b", b"2"), 0);
    assert_eq!(broker.publish(b"c", b"3"), 1);

    let queue = client.queue().unwrap();
    assert_eq!(queue.wait_for_message().await.unwrap().channel, b"a");
    assert_eq!(queue.wait_for_message().await.unwrap().channel, b"c");
    assert!(queue.is_empty());
}

#[tokio::test]
async fn unsubscribe_all_clears_the_whole_class() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();
    client
        .subscribe_blocking(["a", "b"], ChannelKind::Exact, 1000)
        .await
        .unwrap();
    client
        .subscribe_blocking(["p.*"], ChannelKind::Pattern, 1000)
        .await
        .unwrap();

    client
        .unsubscribe_blocking(None, ChannelKind::Exact, 1000)
        .await
        .unwrap();
    let snapshot = client.subscriptions();
    assert!(!snapshot.actual.contains_key(&ChannelKind::Exact));
    assert!(snapshot.actual.contains_key(&ChannelKind::Pattern));
}

#[tokio::test]
async fn callback_clients_have_no_queue() {
    let broker = MockBroker::standalone();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let config = ClientConfig {
        delivery: DeliveryMode::Callback(Arc::new(move |message| {
            sink.lock().unwrap().push(message);
        })),
        ..fast_config()
    };
    let client = Client::new(broker.connect(), config).unwrap();

    assert_eq!(client.queue().unwrap_err().kind(), ErrorKind::Configuration);

    client
        .subscribe_blocking(["cb"], ChannelKind::Exact, 1000)
        .await
        .unwrap();
    broker.publish(b"cb", b"direct");
    eventually(|| !received.lock().unwrap().is_empty()).await;
    assert_eq!(received.lock().unwrap()[0].payload, b"direct");
}

#[tokio::test]
async fn initial_subscriptions_are_established_on_startup() {
    let broker = MockBroker::standalone();
    let mut initial = SubscriptionSet::new();
    initial
        .entry(ChannelKind::Exact)
        .or_default()
        .insert(b"boot".to_vec());
    let config = ClientConfig {
        initial_subscriptions: Some(initial),
        ..fast_config()
    };
    let client = Client::new(broker.connect(), config).unwrap();

    eventually(|| {
        client
            .subscriptions()
            .actual
            .get(&ChannelKind::Exact)
            .is_some_and(|set| set.contains(&b"boot".to_vec()))
    })
    .await;
    assert_eq!(broker.publish(b"boot", b"hello"), 1);
}

#[tokio::test]
async fn denied_subscriptions_raise_the_out_of_sync_counter() {
    let broker = MockBroker::standalone();
    broker.deny_subscriptions(true);
    let client = Client::new(broker.connect(), fast_config()).unwrap();

    client
        .subscribe(["blocked"], ChannelKind::Exact)
        .await
        .unwrap();
    eventually(|| client.statistics().subscription_out_of_sync_count >= 2).await;

    // The counter is monotonic while diverged and stops growing once the
    // denial is lifted and the next pass converges.
    broker.deny_subscriptions(false);
    eventually(|| {
        client
            .subscriptions()
            .actual
            .contains_key(&ChannelKind::Exact)
    })
    .await;
    let settled = client.statistics();
    assert!(settled.subscription_last_sync_timestamp > 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        client.statistics().subscription_out_of_sync_count,
        settled.subscription_out_of_sync_count
    );
}

#[tokio::test]
async fn blocking_subscribe_times_out_while_denied_but_intent_survives() {
    let broker = MockBroker::standalone();
    broker.deny_subscriptions(true);
    let client = Client::new(broker.connect(), fast_config()).unwrap();

    let err = client
        .subscribe_blocking(["blocked"], ChannelKind::Exact, 100)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // Later passes pick the intent up once the broker allows it again.
    broker.deny_subscriptions(false);
    eventually(|| {
        client
            .subscriptions()
            .actual
            .contains_key(&ChannelKind::Exact)
    })
    .await;
}

#[tokio::test]
async fn sharded_pubsub_requires_cluster_mode() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();

    let err = client
        .subscribe(["s"], ChannelKind::Sharded)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    let err = client.publish("s", "x", true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn sharded_publish_reaches_sharded_subscribers() {
    let broker = MockBroker::cluster(3, 1);
    let subscriber = Client::new(broker.connect(), cluster_config()).unwrap();
    let publisher = Client::new(broker.connect(), cluster_config()).unwrap();

    subscriber
        .subscribe_blocking(["orders"], ChannelKind::Sharded, 1000)
        .await
        .unwrap();
    let receivers = publisher.publish("orders", b"#42".to_vec(), true).await.unwrap();
    assert_eq!(receivers, 1);

    let message = subscriber
        .queue()
        .unwrap()
        .wait_for_message()
        .await
        .unwrap();
    assert_eq!(message.channel, b"orders");
    assert!(message.pattern.is_none());
}

#[tokio::test]
async fn publish_counts_all_recipients() {
    let broker = MockBroker::standalone();
    let first = Client::new(broker.connect(), fast_config()).unwrap();
    let second = Client::new(broker.connect(), fast_config()).unwrap();
    let publisher = Client::new(broker.connect(), fast_config()).unwrap();

    first
        .subscribe_blocking(["fan"], ChannelKind::Exact, 1000)
        .await
        .unwrap();
    second
        .subscribe_blocking(["fan"], ChannelKind::Exact, 1000)
        .await
        .unwrap();

    let receivers = publisher.publish("fan", "out", false).await.unwrap();
    assert_eq!(receivers, 2);
}

#[tokio::test]
async fn blocking_subscribe_surfaces_a_dead_connection() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();
    broker.fail_node(&Node::new("localhost", 6379));

    let err = client
        .subscribe_blocking(["x"], ChannelKind::Exact, 500)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);

    // Intent is kept; restoring the node lets reconciliation catch up.
    broker.restore_node(&Node::new("localhost", 6379));
    eventually(|| {
        client
            .subscriptions()
            .actual
            .contains_key(&ChannelKind::Exact)
    })
    .await;
}

#[tokio::test]
async fn indefinitely_blocking_subscribe_errors_on_a_dead_connection() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();
    broker.fail_node(&Node::new("localhost", 6379));

    // Timeout 0 blocks without a deadline; connection loss must still end
    // the wait rather than leaving the caller suspended forever.
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        client.subscribe_blocking(["x"], ChannelKind::Exact, 0),
    )
    .await
    .expect("call must not hang on a dead connection");
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn negative_unsubscribe_timeout_is_rejected_without_state_mutation() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();
    client
        .subscribe_blocking(["keep"], ChannelKind::Exact, 1000)
        .await
        .unwrap();

    let before = client.subscriptions();
    let err = client
        .unsubscribe_blocking(Some(vec![b"keep".to_vec()]), ChannelKind::Exact, -1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(client.subscriptions(), before);

    // The subscription is untouched and still delivers.
    assert_eq!(broker.publish(b"keep", b"still-here"), 1);
}

#[tokio::test]
async fn empty_channel_list_and_negative_timeout_are_rejected() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();

    let empty: Vec<Vec<u8>> = vec![];
    let err = client.subscribe(empty, ChannelKind::Exact).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = client
        .subscribe_blocking(["x"], ChannelKind::Exact, -5)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(client.subscriptions().desired.is_empty());
}

#[tokio::test]
async fn signal_driven_consumption_drains_the_queue() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), fast_config()).unwrap();
    client
        .subscribe_blocking(["sig"], ChannelKind::Exact, 1000)
        .await
        .unwrap();

    let queue = client.queue().unwrap();
    let (_guard, mut signal) = queue.register_signal();
    broker.publish(b"sig", b"one");
    broker.publish(b"sig", b"two");

    signal.recv().await.unwrap();
    let mut drained = Vec::new();
    eventually(|| {
        while let Some(message) = queue.try_pop() {
            drained.push(message);
        }
        drained.len() == 2
    })
    .await;
    assert_eq!(drained[0].payload, b"one");
    assert_eq!(drained[1].payload, b"two");
}

#[tokio::test]
async fn push_stream_can_only_be_claimed_once() {
    let broker = MockBroker::standalone();
    let transport: Arc<dyn valkey_pubsub::Transport> = broker.connect();
    let _client = Client::new(Arc::clone(&transport), fast_config()).unwrap();
    let err = Client::new(transport, fast_config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
