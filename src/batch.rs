//! Batch coordinator
//!
//! Applies a single-item operation to many messages with bounded,
//! order-preserving parallelism. Every item goes through the same
//! [`CallExecutor`], so a batch shares the account's quota window with
//! everything else running against that account.
//!
//! A failing item is recorded in the [`BatchResult`] and never aborts the
//! rest of the batch. Only the query resolution step of
//! [`mark_all_as_read`](BatchCoordinator::mark_all_as_read) and
//! [`archive_all`](BatchCoordinator::archive_all) can fail a whole batch.
//!
//! The coordinator writes fetched messages to the cache but never
//! invalidates; callers invalidate after mutating batches.

use futures::stream::{self, StreamExt};
use serde::{Serialize, Serializer};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span, trace, Instrument};
use uuid::Uuid;

use crate::cache::ResponseCache;
use crate::error::{GmailError, Result};
use crate::executor::{CallEvent, CallExecutor};
use crate::models::{LabelChange, ListQuery, Message, MessageFormat, MessageUpdate};
use crate::remote::{Operation, Response};
use crate::retry::RetryEvent;

/// Largest page requested while resolving a query
const RESOLVE_PAGE_SIZE: usize = 500;

/// Lifecycle of one item inside a batch
///
/// `Pending → Admitted → Attempted → {Succeeded | Retrying → Attempted | Failed}`.
/// A pending item may also finish directly: `Succeeded` on a cache hit,
/// `Failed` when quota admission itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Admitted,
    Attempted,
    Retrying,
    Succeeded,
    Failed,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Succeeded | ItemState::Failed)
    }

    pub fn can_transition_to(&self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (*self, next),
            (Pending, Admitted)
                | (Pending, Succeeded)
                | (Pending, Failed)
                | (Admitted, Attempted)
                | (Attempted, Succeeded)
                | (Attempted, Retrying)
                | (Attempted, Failed)
                | (Retrying, Attempted)
        )
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemState::Pending => "pending",
            ItemState::Admitted => "admitted",
            ItemState::Attempted => "attempted",
            ItemState::Retrying => "retrying",
            ItemState::Succeeded => "succeeded",
            ItemState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks one item's [`ItemState`] from call events
#[derive(Debug)]
pub struct ItemTracker {
    batch_id: Uuid,
    id: String,
    state: ItemState,
}

impl ItemTracker {
    fn new(batch_id: Uuid, id: String) -> Self {
        Self {
            batch_id,
            id,
            state: ItemState::Pending,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Move to `next`; returns false and stays put if the move is not allowed
    fn advance(&mut self, next: ItemState) -> bool {
        if !self.state.can_transition_to(next) {
            debug!(
                batch_id = %self.batch_id,
                item = %self.id,
                "Ignoring item transition {} -> {}",
                self.state,
                next
            );
            return false;
        }
        trace!(
            batch_id = %self.batch_id,
            item = %self.id,
            from = %self.state,
            to = %next,
            "Item state"
        );
        self.state = next;
        true
    }

    fn observe(&mut self, event: &CallEvent<'_>) {
        match event {
            CallEvent::Admitted { .. } => {
                self.advance(ItemState::Admitted);
            }
            CallEvent::Retry(RetryEvent::Attempt { .. }) => {
                self.advance(ItemState::Attempted);
            }
            CallEvent::Retry(RetryEvent::Retrying { .. }) => {
                self.advance(ItemState::Retrying);
            }
            CallEvent::Retry(RetryEvent::GaveUp { .. }) => {}
        }
    }

    fn finish(&mut self, succeeded: bool) {
        self.advance(if succeeded {
            ItemState::Succeeded
        } else {
            ItemState::Failed
        });
    }
}

/// A finished item, reported to the progress callback
#[derive(Debug, Clone)]
pub struct ItemProgress<'a> {
    pub batch_id: Uuid,
    pub id: &'a str,
    pub state: ItemState,
    pub completed: usize,
    pub total: usize,
}

/// Called once per finished item
pub type ProgressCallback = Arc<dyn Fn(&ItemProgress<'_>) + Send + Sync>;

fn error_as_string<S: Serializer>(
    error: &GmailError,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// A failed item and the error that ended it
#[derive(Debug, Serialize)]
pub struct BatchFailure {
    pub id: String,
    #[serde(serialize_with = "error_as_string")]
    pub error: GmailError,
}

/// Outcome of a batch; successes and failures keep input order
#[derive(Debug, Serialize)]
pub struct BatchResult<T> {
    pub batch_id: Uuid,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub successes: Vec<T>,
    pub failures: Vec<BatchFailure>,
}

impl<T> BatchResult<T> {
    fn new(batch_id: Uuid, total: usize) -> Self {
        Self {
            batch_id,
            total,
            succeeded: 0,
            failed: 0,
            successes: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn push(&mut self, id: String, outcome: Result<T>) {
        match outcome {
            Ok(value) => {
                self.succeeded += 1;
                self.successes.push(value);
            }
            Err(error) => {
                self.failed += 1;
                self.failures.push(BatchFailure { id, error });
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.id.as_str())
    }
}

/// Runs per-item operations for many messages through one executor
#[derive(Clone)]
pub struct BatchCoordinator {
    executor: CallExecutor,
    cache: ResponseCache,
    concurrency: usize,
    progress: Option<ProgressCallback>,
}

impl BatchCoordinator {
    pub fn new(executor: CallExecutor, cache: ResponseCache, concurrency: usize) -> Self {
        Self {
            executor,
            cache,
            concurrency: concurrency.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    async fn execute(
        &self,
        account: &str,
        operation: &Operation,
        tracker: &mut ItemTracker,
    ) -> Result<Response> {
        let result = self
            .executor
            .call_observed(account, operation, |event| tracker.observe(&event))
            .await;
        tracker.finish(result.is_ok());
        result
    }

    async fn run_items<T, F, Fut>(
        &self,
        account: &str,
        ids: &[String],
        operation_name: &str,
        per_item: F,
    ) -> BatchResult<T>
    where
        F: Fn(ItemTracker) -> Fut,
        Fut: Future<Output = (ItemTracker, Result<T>)>,
    {
        let batch_id = Uuid::new_v4();
        let total = ids.len();
        let span = info_span!(
            "batch",
            %batch_id,
            operation = operation_name,
            account,
            items = total
        );

        async move {
            let completed = AtomicUsize::new(0);
            let completed = &completed;
            let per_item = &per_item;

            let outcomes: Vec<(String, Result<T>)> = stream::iter(ids.iter().cloned())
                .map(|id| async move {
                    let (tracker, outcome) = per_item(ItemTracker::new(batch_id, id)).await;
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(progress) = &self.progress {
                        progress(&ItemProgress {
                            batch_id,
                            id: tracker.id(),
                            state: tracker.state(),
                            completed: done,
                            total,
                        });
                    }
                    (tracker.id, outcome)
                })
                .buffered(self.concurrency)
                .collect()
                .await;

            let mut result = BatchResult::new(batch_id, total);
            for (id, outcome) in outcomes {
                result.push(id, outcome);
            }

            info!(
                "{} finished: {}/{} succeeded, {} failed",
                operation_name, result.succeeded, result.total, result.failed
            );
            result
        }
        .instrument(span)
        .await
    }

    /// Apply the operation built by `build` to every id
    ///
    /// Each item's response is converted with `extract`; a conversion error
    /// counts as that item's failure.
    pub async fn run<T, B, E>(
        &self,
        account: &str,
        ids: &[String],
        operation_name: &str,
        build: B,
        extract: E,
    ) -> BatchResult<T>
    where
        B: Fn(&str) -> Operation,
        E: Fn(Response) -> Result<T>,
    {
        let build = &build;
        let extract = &extract;
        self.run_items(account, ids, operation_name, move |mut tracker| async move {
            let operation = build(tracker.id());
            let outcome = self
                .execute(account, &operation, &mut tracker)
                .await
                .and_then(extract);
            (tracker, outcome)
        })
        .await
    }

    /// Fetch many messages, serving full and metadata formats from the cache
    pub async fn batch_get(
        &self,
        account: &str,
        ids: &[String],
        format: MessageFormat,
    ) -> BatchResult<Message> {
        let cacheable = format.is_cacheable();
        let metadata_only = format == MessageFormat::Metadata;

        self.run_items(account, ids, "batch_get", move |mut tracker| async move {
            if cacheable {
                if let Some(message) = self
                    .cache
                    .get_message(account, tracker.id(), metadata_only)
                    .await
                {
                    tracker.finish(true);
                    return (tracker, Ok(message));
                }
            }

            let generation = self.cache.generation(account);
            let operation = Operation::GetMessage {
                id: tracker.id().to_string(),
                format,
            };
            let outcome = self
                .execute(account, &operation, &mut tracker)
                .await
                .and_then(Response::into_message);

            if let (true, Ok(message)) = (cacheable, &outcome) {
                self.cache
                    .set_message(account, tracker.id(), message, !metadata_only, generation)
                    .await;
            }
            (tracker, outcome)
        })
        .await
    }

    pub async fn batch_modify_labels(
        &self,
        account: &str,
        ids: &[String],
        change: &LabelChange,
    ) -> BatchResult<MessageUpdate> {
        self.run(
            account,
            ids,
            "batch_modify_labels",
            |id| Operation::ModifyMessage {
                id: id.to_string(),
                change: change.clone(),
            },
            Response::into_update,
        )
        .await
    }

    pub async fn batch_trash(&self, account: &str, ids: &[String]) -> BatchResult<MessageUpdate> {
        self.run(
            account,
            ids,
            "batch_trash",
            |id| Operation::TrashMessage { id: id.to_string() },
            Response::into_update,
        )
        .await
    }

    /// Permanently delete many messages
    pub async fn batch_delete(&self, account: &str, ids: &[String]) -> BatchResult<MessageUpdate> {
        self.run(
            account,
            ids,
            "batch_delete",
            |id| Operation::DeleteMessage { id: id.to_string() },
            Response::into_update,
        )
        .await
    }

    /// Ids matching `query`, newest first, at most `max`
    ///
    /// Pages through messages.list via the executor; never served from the
    /// cache.
    pub async fn resolve_ids(&self, account: &str, query: &str, max: usize) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token = None;

        while ids.len() < max {
            let page_size = (max - ids.len()).min(RESOLVE_PAGE_SIZE);
            let operation = Operation::ListMessages {
                query: ListQuery::new(query).with_max_results(max),
                page_size: page_size as u32,
                page_token: page_token.take(),
            };
            let page = self
                .executor
                .call(account, &operation)
                .await?
                .into_message_page()?;

            ids.extend(page.messages.into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        ids.truncate(max);
        debug!("Resolved {} messages for query {:?}", ids.len(), query);
        Ok(ids)
    }

    /// Remove `UNREAD` from up to `max` messages matching `query`
    pub async fn mark_all_as_read(
        &self,
        account: &str,
        query: &str,
        max: usize,
    ) -> Result<(Vec<String>, BatchResult<MessageUpdate>)> {
        let ids = self.resolve_ids(account, query, max).await?;
        let result = self
            .batch_modify_labels(account, &ids, &LabelChange::remove(&["UNREAD"]))
            .await;
        Ok((ids, result))
    }

    /// Remove `INBOX` from up to `max` inbox messages matching `query`
    pub async fn archive_all(
        &self,
        account: &str,
        query: &str,
        max: usize,
    ) -> Result<(Vec<String>, BatchResult<MessageUpdate>)> {
        let query = if query.trim().is_empty() {
            "in:inbox".to_string()
        } else {
            format!("in:inbox {}", query.trim())
        };
        let ids = self.resolve_ids(account, &query, max).await?;
        let result = self
            .batch_modify_labels(account, &ids, &LabelChange::remove(&["INBOX"]))
            .await;
        Ok((ids, result))
    }
}

impl fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("concurrency", &self.concurrency)
            .field("progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}
