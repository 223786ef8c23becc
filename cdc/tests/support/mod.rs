//! Shared fixtures for integration tests: a scriptable connector, a
//! collecting handler and event builders over a simple sequence-based
//! position token.

#![allow(dead_code)]

use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use cdc::bail;
use cdc::cdc_error;
use cdc::concurrency::shutdown::ShutdownRx;
use cdc::connector::{Connector, EventStream};
use cdc::dispatch::{ChangeHandler, HandlerRegistry, Interceptor};
use cdc::error::{CdcError, CdcResult, ErrorKind};
use cdc::types::{CdcPosition, ChangeContext, ChangeEvent, ChangeMetadata, PositionToken};
use cdc_config::shared::{BatchConfig, CaptureConfig};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

static TRACING: Once = Once::new();

/// Initializes the tracing subscriber once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Monotonic test position token backed by a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceToken(pub u64);

impl PositionToken for SequenceToken {
    fn to_bytes(&self) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    fn compare(&self, other: &dyn PositionToken) -> Option<Ordering> {
        other
            .as_any()
            .downcast_ref::<SequenceToken>()
            .map(|other| self.cmp(other))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds a position at `seq`.
pub fn position(seq: u64) -> CdcPosition {
    CdcPosition::new(SequenceToken(seq))
}

/// Serialized form of a sequence position, as a position store returns it.
pub fn position_blob(seq: u64) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

fn decode_seq(blob: &[u8]) -> u64 {
    blob.try_into().map(u64::from_be_bytes).unwrap_or(0)
}

fn seq_of(event: &ChangeEvent) -> u64 {
    event
        .metadata
        .position
        .downcast_ref::<SequenceToken>()
        .map(|token| token.0)
        .unwrap_or(0)
}

/// Entity type used by the test handlers.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TestUser {
    pub id: u64,
    pub name: String,
}

/// Builds an insert event for `public.users` at `seq`.
pub fn user_insert(seq: u64, id: u64) -> ChangeEvent {
    ChangeEvent::insert(
        "public.users",
        json!({ "id": id, "name": format!("user-{id}") }),
        ChangeMetadata::at_position(position(seq)),
    )
}

/// Builds an insert event for an arbitrary table at `seq`.
pub fn table_insert(table: &str, seq: u64, id: u64) -> ChangeEvent {
    ChangeEvent::insert(
        table,
        json!({ "id": id, "name": format!("user-{id}") }),
        ChangeMetadata::at_position(position(seq)),
    )
}

/// Connector replaying a pre-scripted list of events.
///
/// Resume blobs are decoded as sequence numbers; streaming skips every event
/// at or below the resumed sequence. Clones share the dispose counter, so a
/// factory handing out clones still lets tests observe disposal of the
/// original.
#[derive(Clone)]
pub struct ScriptedConnector {
    id: String,
    events: Vec<ChangeEvent>,
    trailing_error: Option<CdcError>,
    pending_after: bool,
    fail_position: bool,
    dispose_count: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(id: impl Into<String>, events: Vec<ChangeEvent>) -> Self {
        Self {
            id: id.into(),
            events,
            trailing_error: None,
            pending_after: false,
            fail_position: false,
            dispose_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Appends a stream-level error after the scripted events.
    pub fn with_trailing_error(mut self, error: CdcError) -> Self {
        self.trailing_error = Some(error);
        self
    }

    /// Keeps the stream open (suspended) after the scripted events instead of
    /// ending it.
    pub fn with_pending_tail(mut self) -> Self {
        self.pending_after = true;
        self
    }

    /// Makes [`Connector::current_position`] fail.
    pub fn with_failing_position(mut self) -> Self {
        self.fail_position = true;
        self
    }

    pub fn dispose_count(&self) -> usize {
        self.dispose_count.load(AtomicOrdering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream_changes(
        &self,
        resume: Option<Vec<u8>>,
        _shutdown_rx: ShutdownRx,
    ) -> CdcResult<EventStream> {
        let resume_seq = resume.as_deref().map(decode_seq);

        let mut items: Vec<CdcResult<ChangeEvent>> = self
            .events
            .iter()
            .filter(|event| resume_seq.is_none_or(|resume_seq| seq_of(event) > resume_seq))
            .cloned()
            .map(Ok)
            .collect();

        if let Some(error) = &self.trailing_error {
            items.push(Err(error.clone()));
        }

        let stream = futures::stream::iter(items);
        if self.pending_after {
            Ok(stream.chain(futures::stream::pending()).boxed())
        } else {
            Ok(stream.boxed())
        }
    }

    async fn current_position(&self) -> CdcResult<CdcPosition> {
        if self.fail_position {
            bail!(
                ErrorKind::SourceConnectionFailed,
                "Source unreachable",
                format!("connector '{}'", self.id)
            );
        }

        Ok(self
            .events
            .last()
            .map(|event| event.metadata.position.clone())
            .unwrap_or_else(|| position(0)))
    }

    async fn dispose(&self) -> CdcResult<()> {
        self.dispose_count.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }
}

/// Handler recording every invocation, with per-id failure injection.
///
/// `fail_times(id, n)` makes the first `n` inserts of that id fail with
/// [`ErrorKind::HandlerFailed`]; subsequent inserts succeed. Use a count
/// larger than the retry budget to make an id fail permanently.
#[derive(Default)]
pub struct CollectingHandler {
    handled: Mutex<Vec<String>>,
    remaining_failures: Mutex<HashMap<u64, usize>>,
}

impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_times(self: Arc<Self>, id: u64, times: usize) -> Arc<Self> {
        self.remaining_failures.lock().unwrap().insert(id, times);
        self
    }

    pub fn handled(&self) -> Vec<String> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeHandler<TestUser> for CollectingHandler {
    async fn handle_insert(&self, entity: TestUser, _ctx: &ChangeContext) -> CdcResult<()> {
        {
            let mut remaining = self.remaining_failures.lock().unwrap();
            if let Some(times) = remaining.get_mut(&entity.id)
                && *times > 0
            {
                *times -= 1;
                return Err(cdc_error!(
                    ErrorKind::HandlerFailed,
                    "Injected handler failure",
                    format!("user {}", entity.id)
                ));
            }
        }

        self.handled
            .lock()
            .unwrap()
            .push(format!("insert:{}", entity.id));
        Ok(())
    }

    async fn handle_update(
        &self,
        _before: Option<TestUser>,
        after: TestUser,
        _ctx: &ChangeContext,
    ) -> CdcResult<()> {
        self.handled
            .lock()
            .unwrap()
            .push(format!("update:{}", after.id));
        Ok(())
    }

    async fn handle_delete(&self, entity: Option<TestUser>, _ctx: &ChangeContext) -> CdcResult<()> {
        let id = entity.map(|user| user.id.to_string()).unwrap_or_default();
        self.handled.lock().unwrap().push(format!("delete:{id}"));
        Ok(())
    }
}

/// Interceptor recording the table of every dispatched event.
#[derive(Default)]
pub struct CollectingInterceptor {
    seen: Mutex<Vec<String>>,
}

impl CollectingInterceptor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Interceptor for CollectingInterceptor {
    async fn on_event_dispatched(
        &self,
        event: &ChangeEvent,
        _ctx: &ChangeContext,
    ) -> CdcResult<()> {
        self.seen.lock().unwrap().push(event.table_name.clone());
        Ok(())
    }
}

/// Registry routing `public.users` to `handler`.
pub fn users_registry(handler: Arc<CollectingHandler>) -> HandlerRegistry {
    HandlerRegistry::builder()
        .handler::<TestUser, _>("public.users", handler)
        .build()
}

/// Capture configuration with short delays suited to tests.
pub fn test_config() -> CaptureConfig {
    CaptureConfig {
        poll_interval_ms: 10,
        batch: BatchConfig {
            max_size: 16,
            max_fill_ms: 20,
        },
        max_retries: 3,
        base_retry_delay_ms: 1,
        max_retry_delay_ms: 10,
        ..Default::default()
    }
}
