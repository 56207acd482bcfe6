use rstest::rstest;

use valkey_pubsub::{
    Client, ClientConfig, ErrorKind, Node, Route, RoutedResponse, SlotAddr, Value,
};
use valkey_pubsub_test::MockBroker;

fn cluster_client(broker: &std::sync::Arc<MockBroker>) -> Client {
    Client::new(
        broker.connect(),
        ClientConfig {
            cluster_mode: true,
            ..ClientConfig::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn uniform_ping_collapses_to_a_single_pong() {
    let broker = MockBroker::cluster(3, 1);
    let client = cluster_client(&broker);

    let response = client.ping_with_route(None, &Route::AllNodes).await.unwrap();
    let RoutedResponse::Single(Value::SimpleString(reply)) = response else {
        panic!("expected a collapsed reply, got {response:?}");
    };
    assert_eq!(reply, "PONG");
}

#[tokio::test]
async fn ping_with_a_failed_node_keeps_the_per_node_form() {
    let broker = MockBroker::cluster(3, 0);
    let client = cluster_client(&broker);
    broker.fail_node(&Node::new("shard1-primary", 6379));

    let response = client
        .ping_with_route(None, &Route::AllPrimaries)
        .await
        .unwrap();
    let RoutedResponse::Multi(multi) = response else {
        panic!("partial failure must not collapse");
    };
    assert!(!multi.is_complete());
    assert_eq!(multi.values.len(), 2);
    assert_eq!(multi.failures.len(), 1);
    assert_eq!(multi.failures[0].0, Node::new("shard1-primary", 6379));
}

#[tokio::test]
async fn custom_fanout_always_returns_the_per_node_map() {
    let broker = MockBroker::cluster(3, 0);
    let client = cluster_client(&broker);

    // Identical replies everywhere, yet the multi-node form is preserved.
    let response = client
        .custom_command_with_route(["ECHO", "same"], &Route::AllPrimaries)
        .await
        .unwrap();
    let RoutedResponse::Multi(multi) = response else {
        panic!("fan-out must keep the per-node form");
    };
    assert!(multi.is_complete());
    let Value::Map(entries) = multi.into_value().unwrap() else {
        panic!("expected an address-keyed map");
    };
    assert_eq!(entries.len(), 3);
    for (key, value) in entries {
        assert!(matches!(key, Value::BulkString(_)));
        assert_eq!(value, Value::BulkString(b"same".to_vec()));
    }
}

#[tokio::test]
async fn custom_command_routes_to_a_single_addressed_node() {
    let broker = MockBroker::cluster(3, 1);
    let client = cluster_client(&broker);

    let response = client
        .custom_command_with_route(
            ["PING", "hi"],
            &Route::ByAddress("shard2-primary".into(), 6379),
        )
        .await
        .unwrap();
    let RoutedResponse::Single(value) = response else {
        panic!("addressed route must resolve to one node");
    };
    assert_eq!(value, Value::BulkString(b"hi".to_vec()));
}

#[tokio::test]
async fn addressing_an_unknown_host_fails_before_dispatch() {
    let broker = MockBroker::cluster(3, 1);
    let client = cluster_client(&broker);

    let err = client
        .ping_with_route(None, &Route::ByAddress("invalidHost".into(), 6379))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Routing);
}

#[rstest]
#[case::out_of_range(Route::SlotId(SlotAddr::Primary, 16384), ErrorKind::InvalidArgument)]
#[case::no_replica(Route::SlotId(SlotAddr::Replica, 100), ErrorKind::Routing)]
#[tokio::test]
async fn infeasible_slot_routes_are_rejected(
    #[case] route: Route,
    #[case] expected: ErrorKind,
) {
    // No replicas anywhere, so replica-addressed slot routes cannot resolve.
    let broker = MockBroker::cluster(3, 0);
    let client = cluster_client(&broker);

    let err = client
        .custom_command_with_route(["GET", "key"], &route)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), expected);
}

#[tokio::test]
async fn slot_key_routes_honor_hashtags() {
    let broker = MockBroker::cluster(3, 0);
    let client = cluster_client(&broker);

    // Keys sharing a hashtag resolve to the same shard, so both commands
    // succeed against the same addressed primary.
    for key in ["{user}:a", "{user}:b"] {
        let response = client
            .custom_command_with_route(
                ["ECHO", key],
                &Route::SlotKey(SlotAddr::Primary, key.as_bytes().to_vec()),
            )
            .await
            .unwrap();
        assert!(matches!(response, RoutedResponse::Single(_)));
    }
}

#[tokio::test]
async fn empty_custom_commands_are_rejected() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), ClientConfig::default()).unwrap();

    let empty: Vec<Vec<u8>> = vec![];
    let err = client
        .custom_command_with_route(empty, &Route::Random)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn standalone_fanout_covers_the_node_list() {
    let broker = MockBroker::standalone();
    let client = Client::new(broker.connect(), ClientConfig::default()).unwrap();

    let response = client.ping_with_route(None, &Route::AllNodes).await.unwrap();
    assert!(matches!(
        response,
        RoutedResponse::Single(Value::SimpleString(_))
    ));
}

#[tokio::test]
async fn statistics_report_connections_and_clients() {
    let broker = MockBroker::cluster(2, 1);
    let client = cluster_client(&broker);

    let stats = client.statistics();
    assert_eq!(stats.total_connections, 4);
    assert!(stats.total_clients >= 1);
    let map = stats.as_map();
    assert!(map.contains_key("subscription_out_of_sync_count"));
    assert!(map.contains_key("subscription_last_sync_timestamp"));
}
