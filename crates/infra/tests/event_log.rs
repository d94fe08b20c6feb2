//! Event log behaviour against in-memory SQLite.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use eventline_core::{ExpectedVersion, GlobalPosition, Message, MessageId, RecordedMessage};
use eventline_infra::event_store::{
    AggregateStreamOptions, AppendFailure, AppendOptions, AppendResult, EventLog, EventStore, EventStoreError,
    PreCommitHook, ReadStreamOptions,
};
use eventline_infra::sql::{Sql, SqlTransaction};

use common::{GuestEvent, append, checked_in, checked_out, room_cleaned, sqlite_log};

fn expecting(version: ExpectedVersion) -> AppendOptions {
    AppendOptions::default().expected_version(version)
}

#[tokio::test]
async fn appended_messages_read_back_in_stream_order() {
    let log = sqlite_log().await;

    let result = log
        .append_to_stream(
            "guest-ann",
            "guest",
            vec![checked_in("ann"), room_cleaned(12), checked_out("ann")],
            AppendOptions::default(),
        )
        .await
        .unwrap();
    let AppendResult::Success(success) = result else {
        panic!("expected success, got {result:?}");
    };
    assert_eq!(success.next_expected_stream_version, 3);
    assert!(success.created_new_stream);

    let read = log
        .read_stream("guest-ann", ReadStreamOptions::default())
        .await
        .unwrap();
    assert!(read.stream_exists);
    assert_eq!(read.current_stream_version, 3);
    assert_eq!(
        read.messages.iter().map(|m| m.stream_position).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(read.messages[2].global_position, success.last_global_position);

    let events: Vec<GuestEvent> = read.messages.iter().map(|m| m.decode().unwrap()).collect();
    assert_eq!(
        events,
        vec![
            GuestEvent::GuestCheckedIn { guest_id: "ann".into() },
            GuestEvent::RoomCleaned { room: 12 },
            GuestEvent::GuestCheckedOut { guest_id: "ann".into() },
        ]
    );
}

#[tokio::test]
async fn missing_streams_read_as_empty() {
    let log = sqlite_log().await;

    let read = log
        .read_stream("nobody", ReadStreamOptions::default())
        .await
        .unwrap();
    assert!(!read.stream_exists);
    assert_eq!(read.current_stream_version, 0);
    assert!(read.messages.is_empty());
}

#[tokio::test]
async fn read_window_is_inclusive_and_bounded_by_count() {
    let log = sqlite_log().await;
    let messages = (0..6).map(|room| room_cleaned(room)).collect();
    append(&log, "rooms", messages).await;

    let positions = |read: eventline_infra::event_store::ReadStreamResult| {
        read.messages.iter().map(|m| m.stream_position).collect::<Vec<_>>()
    };

    let window = log
        .read_stream("rooms", ReadStreamOptions::new().from(2).to(4))
        .await
        .unwrap();
    assert_eq!(positions(window), vec![2, 3, 4]);

    let counted = log
        .read_stream("rooms", ReadStreamOptions::new().from(3).max_count(2))
        .await
        .unwrap();
    assert_eq!(positions(counted), vec![3, 4]);

    let tighter_to = log
        .read_stream("rooms", ReadStreamOptions::new().to(2).max_count(5))
        .await
        .unwrap();
    assert_eq!(positions(tighter_to.clone()), vec![1, 2]);
    assert_eq!(tighter_to.current_stream_version, 6);
}

#[tokio::test]
async fn exact_version_rejects_stale_writers() {
    let log = sqlite_log().await;

    let first = log
        .append_to_stream("guest-bo", "guest", vec![checked_in("bo")], expecting(ExpectedVersion::Exact(0)))
        .await
        .unwrap();
    assert!(first.is_success());

    let stale = log
        .append_to_stream("guest-bo", "guest", vec![checked_out("bo")], expecting(ExpectedVersion::Exact(0)))
        .await
        .unwrap();
    match stale {
        AppendResult::Failure(AppendFailure::VersionMismatch(conflict)) => {
            assert_eq!(conflict.expected, ExpectedVersion::Exact(0));
            assert_eq!(conflict.actual, 1);
            assert!(conflict.stream_exists);
        }
        other => panic!("expected version mismatch, got {other:?}"),
    }

    let fresh = log
        .append_to_stream("guest-bo", "guest", vec![checked_out("bo")], expecting(ExpectedVersion::Exact(1)))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(fresh.next_expected_stream_version, 2);
    assert!(!fresh.created_new_stream);

    let read = log.read_stream("guest-bo", ReadStreamOptions::default()).await.unwrap();
    assert_eq!(read.messages.len(), 2);
}

#[tokio::test]
async fn existence_sentinels_are_checked() {
    let log = sqlite_log().await;

    let missing = log
        .append_to_stream("guest-cy", "guest", vec![checked_in("cy")], expecting(ExpectedVersion::StreamExists))
        .await
        .unwrap();
    assert!(matches!(missing, AppendResult::Failure(AppendFailure::VersionMismatch(_))));

    let created = log
        .append_to_stream("guest-cy", "guest", vec![checked_in("cy")], expecting(ExpectedVersion::NoStream))
        .await
        .unwrap();
    assert!(created.is_success());

    let duplicate = log
        .append_to_stream("guest-cy", "guest", vec![checked_in("cy")], expecting(ExpectedVersion::NoStream))
        .await
        .unwrap();
    assert!(matches!(duplicate, AppendResult::Failure(AppendFailure::VersionMismatch(_))));

    let existing = log
        .append_to_stream("guest-cy", "guest", vec![checked_out("cy")], expecting(ExpectedVersion::StreamExists))
        .await
        .unwrap();
    assert!(existing.is_success());
}

#[tokio::test]
async fn empty_batches_are_refused_without_touching_the_stream() {
    let log = sqlite_log().await;

    let result = log
        .append_to_stream("guest-di", "guest", Vec::new(), AppendOptions::default())
        .await
        .unwrap();
    assert_eq!(result, AppendResult::Failure(AppendFailure::EmptyBatch));
    assert!(matches!(result.into_result(), Err(EventStoreError::InvalidAppend(_))));

    let read = log.read_stream("guest-di", ReadStreamOptions::default()).await.unwrap();
    assert!(!read.stream_exists);
}

#[tokio::test]
async fn global_positions_follow_commit_order_across_streams() {
    let log = sqlite_log().await;

    append(&log, "guest-a", vec![checked_in("a")]).await;
    append(&log, "guest-b", vec![checked_in("b")]).await;
    append(&log, "guest-a", vec![checked_out("a")]).await;

    let batch = log
        .read_messages_batch(GlobalPosition::ZERO, 10, "global")
        .await
        .unwrap();
    let order: Vec<(&str, u64)> = batch
        .messages
        .iter()
        .map(|m| (m.stream_name.as_str(), m.stream_position))
        .collect();
    assert_eq!(order, vec![("guest-a", 1), ("guest-b", 1), ("guest-a", 2)]);
    assert!(batch.messages.windows(2).all(|w| w[0].global_position < w[1].global_position));
    assert_eq!(batch.last_position, batch.messages.last().map(|m| m.global_position));

    let tail = log.read_last_global_position("global").await.unwrap();
    assert_eq!(tail, batch.last_position);

    let after_first = log
        .read_messages_batch(batch.messages[0].global_position, 10, "global")
        .await
        .unwrap();
    assert_eq!(after_first.len(), 2);
}

#[tokio::test]
async fn partitions_are_isolated() {
    let log = sqlite_log().await;

    log.append_to_stream(
        "guest-ed",
        "guest",
        vec![checked_in("ed")],
        AppendOptions::default().partition("tenant-a"),
    )
    .await
    .unwrap()
    .into_result()
    .unwrap();

    let in_default = log.read_stream("guest-ed", ReadStreamOptions::default()).await.unwrap();
    assert!(!in_default.stream_exists);

    let in_tenant = log
        .read_stream("guest-ed", ReadStreamOptions::default().partition("tenant-a"))
        .await
        .unwrap();
    assert_eq!(in_tenant.messages.len(), 1);
    assert_eq!(in_tenant.messages[0].partition, "tenant-a");

    assert_eq!(log.read_last_global_position("global").await.unwrap(), None);
    assert!(log.read_last_global_position("tenant-a").await.unwrap().is_some());
}

struct RejectEverything;

#[async_trait]
impl PreCommitHook for RejectEverything {
    async fn before_commit(
        &self,
        _messages: &[RecordedMessage],
        _tx: &mut dyn SqlTransaction,
    ) -> anyhow::Result<()> {
        anyhow::bail!("guest list is closed")
    }
}

#[tokio::test]
async fn failing_pre_commit_hook_rolls_the_append_back() {
    let log = sqlite_log().await;

    let err = log
        .append_to_stream(
            "guest-fay",
            "guest",
            vec![checked_in("fay")],
            AppendOptions::default().before_commit(Arc::new(RejectEverything)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::PreCommit { .. }));
    assert!(err.to_string().contains("guest list is closed"));

    let read = log.read_stream("guest-fay", ReadStreamOptions::default()).await.unwrap();
    assert!(!read.stream_exists);
    assert_eq!(log.read_last_global_position("global").await.unwrap(), None);
}

#[tokio::test]
async fn upcaster_rewrites_legacy_messages_on_every_read() {
    let log = sqlite_log().await.with_upcaster(Arc::new(|mut message: RecordedMessage| {
        if message.message_type == "GuestRegistered" {
            message.message_type = "GuestCheckedIn".to_string();
            message.data = json!({ "guest_id": message.data["guest"].clone() });
            message.schema_version = 2;
        }
        message
    }));

    append(&log, "guest-gus", vec![Message::new("GuestRegistered", json!({ "guest": "gus" }))]).await;

    let read = log.read_stream("guest-gus", ReadStreamOptions::default()).await.unwrap();
    assert_eq!(read.messages[0].schema_version, 2);
    assert_eq!(
        read.messages[0].decode::<GuestEvent>().unwrap(),
        GuestEvent::GuestCheckedIn { guest_id: "gus".into() }
    );

    let batch = log
        .read_messages_batch(GlobalPosition::ZERO, 10, "global")
        .await
        .unwrap();
    assert_eq!(batch.messages[0].message_type, "GuestCheckedIn");
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProductItem {
    product_id: String,
    quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum ShoppingCartEvent {
    ProductItemAdded { product_item: ProductItem },
    ShoppingCartConfirmed { confirmed_at: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CartStatus {
    #[default]
    Opened,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct ShoppingCart {
    product_items_count: u32,
    status: CartStatus,
}

fn evolve(state: ShoppingCart, event: ShoppingCartEvent) -> ShoppingCart {
    match event {
        ShoppingCartEvent::ProductItemAdded { product_item } => ShoppingCart {
            product_items_count: state.product_items_count + product_item.quantity,
            ..state
        },
        ShoppingCartEvent::ShoppingCartConfirmed { .. } => ShoppingCart {
            status: CartStatus::Confirmed,
            ..state
        },
    }
}

#[tokio::test]
async fn aggregate_stream_folds_a_shopping_cart() {
    let log = sqlite_log().await;
    let events = [
        ShoppingCartEvent::ProductItemAdded {
            product_item: ProductItem {
                product_id: "shoes".into(),
                quantity: 10,
            },
        },
        ShoppingCartEvent::ShoppingCartConfirmed {
            confirmed_at: "2024-05-01T10:00:00Z".into(),
        },
    ];
    log.append_to_stream(
        "shopping_cart-1",
        "shopping_cart",
        events.iter().map(|e| Message::event(e).unwrap()).collect(),
        expecting(ExpectedVersion::NoStream),
    )
    .await
    .unwrap()
    .into_result()
    .unwrap();

    let cart = log
        .aggregate_stream(
            "shopping_cart-1",
            ShoppingCart::default(),
            evolve,
            AggregateStreamOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        cart.state,
        ShoppingCart {
            product_items_count: 10,
            status: CartStatus::Confirmed,
        }
    );
    assert_eq!(cart.current_stream_version, 2);
    assert!(cart.stream_exists);

    let stale = log
        .aggregate_stream(
            "shopping_cart-1",
            ShoppingCart::default(),
            evolve,
            AggregateStreamOptions::new().expected_version(ExpectedVersion::Exact(1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(stale, EventStoreError::Concurrency(c) if c.actual == 2));
}

#[tokio::test]
async fn aggregate_of_a_missing_stream_is_the_initial_state() {
    let log = sqlite_log().await;

    let cart = log
        .aggregate_stream(
            "shopping_cart-missing",
            ShoppingCart::default(),
            evolve,
            AggregateStreamOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(cart.state, ShoppingCart::default());
    assert_eq!(cart.current_stream_version, 0);
    assert!(!cart.stream_exists);
}

/// A message row one past its stream row: what a reader finds when an append
/// commits between reading the stream version and reading the rows.
async fn insert_row_ahead_of_stream(log: &EventLog, stream: &str, stream_position: u64) {
    log.executor()
        .command(
            &Sql::new(
                "insert_row_ahead",
                "INSERT INTO messages (stream_id, stream_position, partition, message_kind, message_data, \
                 message_metadata, message_schema_version, message_type, message_id, is_archived, created_at) \
                 VALUES ($1, $2, 'global', 'E', '{}', '{}', '1', 'GuestCheckedOut', $3, FALSE, \
                 '2024-05-01T10:00:00.000000Z')",
            )
            .bind(stream)
            .bind(stream_position)
            .bind(MessageId::new().to_string()),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn reads_never_run_past_the_reported_version() {
    let log = sqlite_log().await;
    append(&log, "guest-ann", vec![checked_in("ann"), room_cleaned(4)]).await;
    insert_row_ahead_of_stream(&log, "guest-ann", 3).await;

    let read = log.read_stream("guest-ann", ReadStreamOptions::default()).await.unwrap();
    assert_eq!(read.current_stream_version, 2);
    assert_eq!(
        read.messages.iter().map(|m| m.stream_position).collect::<Vec<_>>(),
        vec![1, 2]
    );

    let windowed = log
        .read_stream("guest-ann", ReadStreamOptions::new().from(2).to(10))
        .await
        .unwrap();
    assert_eq!(windowed.messages.len(), 1);

    let folded = log
        .aggregate_stream(
            "guest-ann",
            0u64,
            |count, _: serde_json::Value| count + 1,
            AggregateStreamOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(folded.state, 2);
    assert_eq!(folded.current_stream_version, 2);
}

#[tokio::test]
async fn concurrent_appends_to_one_stream_never_share_a_position() {
    let log = sqlite_log().await;
    append(&log, "guest-hal", vec![checked_in("hal")]).await;

    let attempts = (0..4).map(|_| {
        let log = log.clone();
        tokio::spawn(async move {
            log.append_to_stream(
                "guest-hal",
                "guest",
                vec![checked_out("hal")],
                expecting(ExpectedVersion::Exact(1)),
            )
            .await
            .unwrap()
        })
    });
    let mut winners = 0;
    for attempt in attempts.collect::<Vec<_>>() {
        if attempt.await.unwrap().is_success() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let read = log.read_stream("guest-hal", ReadStreamOptions::default()).await.unwrap();
    assert_eq!(read.current_stream_version, 2);
    assert_eq!(read.messages.len(), 2);
}
