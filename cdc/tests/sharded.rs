//! Tests of sharded fan-in: per-shard ordering, failure isolation, dynamic
//! topology, disposal and per-shard position tracking.

mod support;

use std::collections::HashMap;
use std::sync::Arc;

use cdc::cdc_error;
use cdc::concurrency::shutdown::create_shutdown_channel;
use cdc::connector::sharded::ShardedConnector;
use cdc::connector::ShardInfo;
use cdc::dispatch::Dispatcher;
use cdc::error::{CdcResult, ErrorKind};
use cdc::processor::sharded::{ShardedProcessor, shard_position_key};
use cdc::store::{DeadLetterStore, MemoryDeadLetterStore, MemoryPositionStore, PositionStore};
use cdc::types::ShardedChangeEvent;
use futures::StreamExt;

use support::{
    CollectingHandler, ScriptedConnector, SequenceToken, position, position_blob, test_config,
    user_insert, users_registry,
};

/// Factory handing out clones of pre-scripted per-shard connectors.
fn scripts_factory(
    scripts: HashMap<String, ScriptedConnector>,
) -> impl Fn(&ShardInfo) -> CdcResult<ScriptedConnector> + Send + Sync + 'static {
    move |info| {
        scripts.get(&info.shard_id).cloned().ok_or_else(|| {
            cdc_error!(
                ErrorKind::ShardNotFound,
                "No script for shard",
                info.shard_id.clone()
            )
        })
    }
}

fn topology(shard_ids: &[&str]) -> Vec<ShardInfo> {
    shard_ids.iter().map(|id| ShardInfo::new(*id)).collect()
}

fn seq_of(event: &ShardedChangeEvent) -> u64 {
    event
        .shard_position
        .downcast_ref::<SequenceToken>()
        .map(|token| token.0)
        .unwrap_or(0)
}

#[tokio::test]
async fn aggregates_shards_preserving_per_shard_order() {
    support::init_tracing();

    let scripts = HashMap::from([
        (
            "shard-a".to_string(),
            ScriptedConnector::new(
                "shard-a",
                vec![user_insert(1, 1), user_insert(2, 2), user_insert(3, 3)],
            ),
        ),
        (
            "shard-b".to_string(),
            ScriptedConnector::new("shard-b", vec![user_insert(1, 11), user_insert(2, 12)]),
        ),
    ]);
    let connector =
        ShardedConnector::new("agg", &topology(&["shard-a", "shard-b"]), scripts_factory(scripts))
            .unwrap();

    let (_tx, shutdown_rx) = create_shutdown_channel();
    let stream = connector
        .stream_all_shards(HashMap::new(), shutdown_rx)
        .await
        .unwrap();
    let items: Vec<_> = stream.collect().await;

    let events: Vec<ShardedChangeEvent> = items.into_iter().map(|item| item.unwrap()).collect();
    assert_eq!(events.len(), 5);

    // Within each shard, events arrive in their original sequence order.
    for shard_id in ["shard-a", "shard-b"] {
        let seqs: Vec<u64> = events
            .iter()
            .filter(|event| event.shard_id == shard_id)
            .map(seq_of)
            .collect();
        assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

#[tokio::test]
async fn failing_shard_does_not_affect_siblings() {
    support::init_tracing();

    let scripts = HashMap::from([
        (
            "shard-a".to_string(),
            ScriptedConnector::new("shard-a", vec![user_insert(1, 1), user_insert(2, 2)]),
        ),
        (
            "shard-b".to_string(),
            ScriptedConnector::new("shard-b", vec![user_insert(1, 11)]).with_trailing_error(
                cdc_error!(ErrorKind::SourceStreamFailed, "Shard went away"),
            ),
        ),
    ]);
    let connector =
        ShardedConnector::new("agg", &topology(&["shard-a", "shard-b"]), scripts_factory(scripts))
            .unwrap();

    let (_tx, shutdown_rx) = create_shutdown_channel();
    let stream = connector
        .stream_all_shards(HashMap::new(), shutdown_rx)
        .await
        .unwrap();
    let items: Vec<_> = stream.collect().await;

    let ok_count = items.iter().filter(|item| item.is_ok()).count();
    let errors: Vec<_> = items.iter().filter_map(|item| item.as_ref().err()).collect();

    // All three successful events flowed through despite shard-b failing.
    assert_eq!(ok_count, 3);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), ErrorKind::ShardStreamFailed);
    assert!(errors[0].detail().unwrap_or_default().contains("shard-b"));
}

#[tokio::test]
async fn single_shard_stream_wraps_events_with_shard_identity() {
    support::init_tracing();

    let scripts = HashMap::from([(
        "shard-a".to_string(),
        ScriptedConnector::new("shard-a", vec![user_insert(1, 1), user_insert(2, 2)]),
    )]);
    let connector =
        ShardedConnector::new("agg", &topology(&["shard-a"]), scripts_factory(scripts)).unwrap();

    let (_tx, shutdown_rx) = create_shutdown_channel();
    let stream = connector
        .stream_shard("shard-a", None, shutdown_rx.clone())
        .await
        .unwrap();
    let events: Vec<ShardedChangeEvent> = stream.map(|item| item.unwrap()).collect().await;

    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|event| event.shard_id == "shard-a"));

    // The stream type has no Debug form, so drop the success value before
    // unwrapping the error.
    let err = connector
        .stream_shard("shard-x", None, shutdown_rx)
        .await
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShardNotFound);
}

#[tokio::test]
async fn topology_changes_take_effect_on_next_stream() {
    support::init_tracing();

    let shard_b = ScriptedConnector::new("shard-b", vec![user_insert(1, 11)]);
    let scripts = HashMap::from([
        (
            "shard-a".to_string(),
            ScriptedConnector::new("shard-a", vec![user_insert(1, 1)]),
        ),
        ("shard-b".to_string(), shard_b.clone()),
        (
            "shard-c".to_string(),
            ScriptedConnector::new("shard-c", vec![user_insert(1, 21)]),
        ),
    ]);
    let connector =
        ShardedConnector::new("agg", &topology(&["shard-a", "shard-b"]), scripts_factory(scripts))
            .unwrap();

    assert_eq!(connector.shard_ids().await, ["shard-a", "shard-b"]);

    // Adding is idempotent on the shard id.
    assert!(connector.add_connector(&ShardInfo::new("shard-c")).await.unwrap());
    assert!(!connector.add_connector(&ShardInfo::new("shard-c")).await.unwrap());
    assert_eq!(connector.shard_ids().await, ["shard-a", "shard-b", "shard-c"]);

    // Removing unregisters and disposes exactly once.
    assert!(connector.remove_connector("shard-b").await.unwrap());
    assert!(!connector.remove_connector("shard-b").await.unwrap());
    assert_eq!(shard_b.dispose_count(), 1);

    let (_tx, shutdown_rx) = create_shutdown_channel();
    let stream = connector
        .stream_all_shards(HashMap::new(), shutdown_rx)
        .await
        .unwrap();
    let events: Vec<ShardedChangeEvent> = stream.map(|item| item.unwrap()).collect().await;

    let mut shard_ids: Vec<&str> = events.iter().map(|event| event.shard_id.as_str()).collect();
    shard_ids.sort();
    assert_eq!(shard_ids, ["shard-a", "shard-c"]);
}

#[tokio::test]
async fn adding_a_shard_leaves_an_open_stream_unaffected() {
    support::init_tracing();

    let scripts = HashMap::from([
        (
            "shard-a".to_string(),
            ScriptedConnector::new("shard-a", vec![user_insert(1, 1), user_insert(2, 2)]),
        ),
        (
            "shard-b".to_string(),
            ScriptedConnector::new("shard-b", vec![user_insert(1, 11)]),
        ),
        (
            "shard-c".to_string(),
            ScriptedConnector::new("shard-c", vec![user_insert(1, 21)]),
        ),
    ]);
    let connector =
        ShardedConnector::new("agg", &topology(&["shard-a", "shard-b"]), scripts_factory(scripts))
            .unwrap();

    let (_tx, shutdown_rx) = create_shutdown_channel();
    let mut stream = connector
        .stream_all_shards(HashMap::new(), shutdown_rx.clone())
        .await
        .unwrap();

    // Start draining, then mutate the topology mid-flight.
    let first = stream.next().await.unwrap().unwrap();
    assert!(connector.add_connector(&ShardInfo::new("shard-c")).await.unwrap());

    let mut events: Vec<ShardedChangeEvent> =
        stream.map(|item| item.unwrap()).collect().await;
    events.insert(0, first);

    // The open stream still covers only the shards registered when it was
    // created.
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|event| event.shard_id != "shard-c"));

    // The next call picks up the new shard.
    let stream = connector
        .stream_all_shards(HashMap::new(), shutdown_rx)
        .await
        .unwrap();
    let events: Vec<ShardedChangeEvent> = stream.map(|item| item.unwrap()).collect().await;
    assert_eq!(events.len(), 4);
    assert!(events.iter().any(|event| event.shard_id == "shard-c"));
}

#[tokio::test]
async fn all_positions_succeed_or_fail_wholesale() {
    support::init_tracing();

    let scripts = HashMap::from([
        (
            "shard-a".to_string(),
            ScriptedConnector::new("shard-a", vec![user_insert(5, 1)]),
        ),
        (
            "shard-b".to_string(),
            ScriptedConnector::new("shard-b", vec![user_insert(9, 11)]),
        ),
    ]);
    let connector = ShardedConnector::new(
        "agg",
        &topology(&["shard-a", "shard-b"]),
        scripts_factory(scripts),
    )
    .unwrap();

    let positions = connector.get_all_positions().await.unwrap();
    assert_eq!(positions["shard-a"], position(5));
    assert_eq!(positions["shard-b"], position(9));

    // One unreachable shard fails the whole query; no partial map is returned.
    let scripts = HashMap::from([
        (
            "shard-a".to_string(),
            ScriptedConnector::new("shard-a", vec![user_insert(5, 1)]),
        ),
        (
            "shard-b".to_string(),
            ScriptedConnector::new("shard-b", vec![]).with_failing_position(),
        ),
    ]);
    let connector = ShardedConnector::new(
        "agg",
        &topology(&["shard-a", "shard-b"]),
        scripts_factory(scripts),
    )
    .unwrap();

    let err = connector.get_all_positions().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourcePositionUnavailable);
}

#[tokio::test]
async fn dispose_is_idempotent_and_terminal() {
    support::init_tracing();

    let shard_a = ScriptedConnector::new("shard-a", vec![]);
    let shard_b = ScriptedConnector::new("shard-b", vec![]);
    let scripts = HashMap::from([
        ("shard-a".to_string(), shard_a.clone()),
        ("shard-b".to_string(), shard_b.clone()),
    ]);
    let connector =
        ShardedConnector::new("agg", &topology(&["shard-a", "shard-b"]), scripts_factory(scripts))
            .unwrap();

    connector.dispose().await.unwrap();
    connector.dispose().await.unwrap();

    assert_eq!(shard_a.dispose_count(), 1);
    assert_eq!(shard_b.dispose_count(), 1);

    let (_tx, shutdown_rx) = create_shutdown_channel();
    let err = connector
        .stream_all_shards(HashMap::new(), shutdown_rx)
        .await
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectorDisposed);

    let err = connector
        .add_connector(&ShardInfo::new("shard-c"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectorDisposed);
}

#[tokio::test]
async fn sharded_processor_tracks_positions_per_shard() {
    support::init_tracing();

    let scripts = HashMap::from([
        (
            "shard-a".to_string(),
            ScriptedConnector::new("shard-a", vec![user_insert(1, 1), user_insert(2, 2)]),
        ),
        (
            "shard-b".to_string(),
            ScriptedConnector::new("shard-b", vec![user_insert(1, 11)]),
        ),
    ]);
    let connector = Arc::new(
        ShardedConnector::new("agg", &topology(&["shard-a", "shard-b"]), scripts_factory(scripts))
            .unwrap(),
    );

    let handler = CollectingHandler::new();
    let dispatcher = Arc::new(Dispatcher::new(users_registry(handler.clone())));
    let positions = MemoryPositionStore::new();

    let processor = ShardedProcessor::new(
        connector,
        dispatcher,
        positions.clone(),
        Some(MemoryDeadLetterStore::new()),
        Arc::new(test_config()),
    );
    processor.start().unwrap().wait().await.unwrap();

    let mut handled = handler.handled();
    handled.sort();
    assert_eq!(handled, ["insert:1", "insert:11", "insert:2"]);

    // Each shard's position lives under its own derived key.
    assert_eq!(
        positions
            .get_position(&shard_position_key("agg", "shard-a"))
            .await
            .unwrap(),
        Some(position_blob(2))
    );
    assert_eq!(
        positions
            .get_position(&shard_position_key("agg", "shard-b"))
            .await
            .unwrap(),
        Some(position_blob(1))
    );
}

#[tokio::test]
async fn sharded_processor_resumes_each_shard_independently() {
    support::init_tracing();

    let positions = MemoryPositionStore::new();
    positions
        .save_position(&shard_position_key("agg", "shard-a"), &position(1))
        .await
        .unwrap();

    let scripts = HashMap::from([
        (
            "shard-a".to_string(),
            ScriptedConnector::new("shard-a", vec![user_insert(1, 1), user_insert(2, 2)]),
        ),
        (
            "shard-b".to_string(),
            ScriptedConnector::new("shard-b", vec![user_insert(1, 11)]),
        ),
    ]);
    let connector = Arc::new(
        ShardedConnector::new("agg", &topology(&["shard-a", "shard-b"]), scripts_factory(scripts))
            .unwrap(),
    );

    let handler = CollectingHandler::new();
    let dispatcher = Arc::new(Dispatcher::new(users_registry(handler.clone())));

    let processor = ShardedProcessor::new(
        connector,
        dispatcher,
        positions,
        Some(MemoryDeadLetterStore::new()),
        Arc::new(test_config()),
    );
    processor.start().unwrap().wait().await.unwrap();

    // shard-a resumed past its first event; shard-b started from the default.
    let mut handled = handler.handled();
    handled.sort();
    assert_eq!(handled, ["insert:11", "insert:2"]);
}

#[tokio::test]
async fn sharded_dead_letters_carry_shard_identity() {
    support::init_tracing();

    let scripts = HashMap::from([
        (
            "shard-a".to_string(),
            ScriptedConnector::new("shard-a", vec![user_insert(1, 1)]),
        ),
        (
            "shard-b".to_string(),
            ScriptedConnector::new("shard-b", vec![user_insert(1, 42)]),
        ),
    ]);
    let connector = Arc::new(
        ShardedConnector::new("agg", &topology(&["shard-a", "shard-b"]), scripts_factory(scripts))
            .unwrap(),
    );

    let handler = CollectingHandler::new().fail_times(42, usize::MAX);
    let dispatcher = Arc::new(Dispatcher::new(users_registry(handler.clone())));
    let dead_letters = MemoryDeadLetterStore::new();

    let processor = ShardedProcessor::new(
        connector,
        dispatcher,
        MemoryPositionStore::new(),
        Some(dead_letters.clone()),
        Arc::new(test_config()),
    );
    processor.start().unwrap().wait().await.unwrap();

    assert_eq!(handler.handled(), ["insert:1"]);

    let pending = dead_letters.get_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].shard_id.as_deref(), Some("shard-b"));
    assert_eq!(pending[0].error_kind, ErrorKind::HandlerFailed);
}
