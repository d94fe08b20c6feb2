//! Shared fixtures: an in-memory SQLite log and a guest-summary projection.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use eventline_core::{Message, RecordedMessage};
use eventline_infra::event_store::{AppendOptions, EventLog, EventStore};
use eventline_infra::projections::ProjectionDefinition;
use eventline_infra::sql::schema::create_schema;
use eventline_infra::sql::{Sql, SqlExecutor, SqlTransaction, SqliteExecutor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GuestEvent {
    GuestCheckedIn { guest_id: String },
    GuestCheckedOut { guest_id: String },
    RoomCleaned { room: u32 },
}

pub fn checked_in(guest_id: &str) -> Message {
    Message::event(&GuestEvent::GuestCheckedIn {
        guest_id: guest_id.to_string(),
    })
    .unwrap()
}

pub fn checked_out(guest_id: &str) -> Message {
    Message::event(&GuestEvent::GuestCheckedOut {
        guest_id: guest_id.to_string(),
    })
    .unwrap()
}

pub fn room_cleaned(room: u32) -> Message {
    Message::event(&GuestEvent::RoomCleaned { room }).unwrap()
}

pub async fn sqlite() -> Arc<SqliteExecutor> {
    eventline_observability::init_for_tests();
    let executor = SqliteExecutor::in_memory().await.unwrap();
    create_schema(&executor).await.unwrap();
    Arc::new(executor)
}

pub async fn sqlite_log() -> EventLog {
    EventLog::new(sqlite().await)
}

pub async fn append(log: &EventLog, stream: &str, messages: Vec<Message>) {
    log.append_to_stream(stream, "guest", messages, AppendOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();
}

/// Check-in/check-out counts per guest, kept in a SQL table.
///
/// `fail_at` makes `handle` error on the message at that global position
/// (0 disables), to simulate a crash mid-rebuild.
#[derive(Default)]
pub struct GuestSummary {
    pub fail_at: AtomicU64,
    pub handled: AtomicU64,
}

impl GuestSummary {
    pub fn failing_at(position: u64) -> Self {
        Self {
            fail_at: AtomicU64::new(position),
            handled: AtomicU64::new(0),
        }
    }

    pub fn heal(&self) {
        self.fail_at.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProjectionDefinition for GuestSummary {
    fn name(&self) -> &str {
        "guest_summary"
    }

    fn can_handle(&self) -> &[&'static str] {
        &["GuestCheckedIn", "GuestCheckedOut"]
    }

    async fn init(&self, tx: &mut dyn SqlTransaction) -> anyhow::Result<()> {
        tx.command(&Sql::new(
            "create_guest_summary",
            "CREATE TABLE IF NOT EXISTS guest_summary (\
                 guest_id TEXT PRIMARY KEY, \
                 check_ins BIGINT NOT NULL DEFAULT 0, \
                 check_outs BIGINT NOT NULL DEFAULT 0)",
        ))
        .await?;
        Ok(())
    }

    async fn handle(
        &self,
        messages: &[RecordedMessage],
        tx: &mut dyn SqlTransaction,
    ) -> anyhow::Result<()> {
        for message in messages {
            if self.fail_at.load(Ordering::SeqCst) == message.global_position.value() {
                anyhow::bail!("simulated crash at {}", message.global_position);
            }

            let (guest_id, column) = match message.decode::<GuestEvent>()? {
                GuestEvent::GuestCheckedIn { guest_id } => (guest_id, "check_ins"),
                GuestEvent::GuestCheckedOut { guest_id } => (guest_id, "check_outs"),
                GuestEvent::RoomCleaned { .. } => anyhow::bail!("unexpected {}", message.message_type),
            };
            tx.command(
                &Sql::new(
                    "project_guest",
                    format!(
                        "INSERT INTO guest_summary (guest_id, {column}) VALUES ($1, 1) \
                         ON CONFLICT (guest_id) DO UPDATE SET {column} = guest_summary.{column} + 1"
                    ),
                )
                .bind(guest_id),
            )
            .await?;
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn truncate(&self, tx: &mut dyn SqlTransaction) -> anyhow::Result<()> {
        tx.command(&Sql::new("truncate_guest_summary", "DELETE FROM guest_summary"))
            .await?;
        Ok(())
    }
}

/// `(guest_id, check_ins, check_outs)` ordered by guest.
pub async fn guest_rows(executor: &dyn SqlExecutor) -> Vec<(String, i64, i64)> {
    let rows = executor
        .query(&Sql::new(
            "read_guest_summary",
            "SELECT guest_id, check_ins, check_outs FROM guest_summary ORDER BY guest_id",
        ))
        .await
        .unwrap();
    rows.iter()
        .map(|row| {
            (
                row.try_string("guest_id").unwrap(),
                row.try_i64("check_ins").unwrap(),
                row.try_i64("check_outs").unwrap(),
            )
        })
        .collect()
}
