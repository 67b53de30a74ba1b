//! Per-account mail service
//!
//! [`MailService`] is the entry point callers use. Reads consult the response
//! cache before reaching the executor; writes invalidate the affected cache
//! entries before returning, whether or not the remote call succeeded, since
//! an exhausted retry may still have been applied remotely.

use std::sync::Arc;
use tracing::{debug, info};

use crate::batch::{BatchCoordinator, BatchResult, ProgressCallback};
use crate::cache::{CacheStats, ResponseCache};
use crate::config::Config;
use crate::error::{GmailError, Result};
use crate::executor::CallExecutor;
use crate::models::{
    AttachmentData, Draft, DraftRef, Label, LabelChange, LabelDetail, LabelUpdate, ListQuery,
    Message, MessageFormat, MessageRef, MessageUpdate, NewLabel, OutgoingMessage, Profile, Thread,
    ThreadRef,
};
use crate::quota::{QuotaManager, QuotaUsage};
use crate::remote::{Operation, RemoteService, Response};
use crate::retry::RetryPolicy;

/// Largest page requested from messages.list
const MAX_PAGE_SIZE: usize = 500;

/// Default query for [`MailService::mark_all_as_read`]
pub const DEFAULT_UNREAD_QUERY: &str = "is:unread";

/// Cache entries a mutation makes stale
enum Stale<'a> {
    Message(&'a str),
    Lists,
    MessageAndLists(&'a str),
    /// Every message of the account, plus lists
    AllMessages,
    Labels,
}

/// Mail operations for one account
///
/// Cloning is cheap. Handles created with [`for_account`](Self::for_account)
/// share the quota manager, cache and remote service.
#[derive(Clone, Debug)]
pub struct MailService {
    account: String,
    executor: CallExecutor,
    cache: ResponseCache,
    batch: BatchCoordinator,
    max_messages: usize,
}

impl MailService {
    pub fn new(
        account: impl Into<String>,
        executor: CallExecutor,
        cache: ResponseCache,
        concurrency: usize,
        max_messages: usize,
    ) -> Self {
        let batch = BatchCoordinator::new(executor.clone(), cache.clone(), concurrency);
        Self {
            account: account.into(),
            executor,
            cache,
            batch,
            max_messages,
        }
    }

    /// Build the quota manager, retry policy and cache from configuration
    pub fn from_config(
        account: impl Into<String>,
        remote: Arc<dyn RemoteService>,
        config: &Config,
    ) -> Self {
        let executor = CallExecutor::new(
            remote,
            QuotaManager::new(&config.quota),
            RetryPolicy::from_config(&config.retry),
        );
        Self::new(
            account,
            executor,
            ResponseCache::from_config(&config.cache),
            config.batch.concurrency,
            config.batch.max_messages,
        )
    }

    /// A handle for another account sharing this one's resources
    pub fn for_account(&self, account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            ..self.clone()
        }
    }

    /// Report every finished batch item to `progress`
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.batch = self.batch.with_progress(progress);
        self
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn executor(&self) -> &CallExecutor {
        &self.executor
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    async fn call(&self, operation: Operation) -> Result<Response> {
        self.executor.call(&self.account, &operation).await
    }

    async fn invalidate(&self, stale: Stale<'_>) {
        match stale {
            Stale::Message(id) => self.cache.invalidate_message(&self.account, id).await,
            Stale::Lists => self.cache.invalidate_lists(&self.account).await,
            Stale::MessageAndLists(id) => {
                self.cache.invalidate_message(&self.account, id).await;
                self.cache.invalidate_lists(&self.account).await;
            }
            Stale::AllMessages => {
                self.cache.invalidate_messages(&self.account).await;
                self.cache.invalidate_lists(&self.account).await;
            }
            Stale::Labels => self.cache.invalidate_labels(&self.account).await,
        }
    }

    async fn mutate(&self, operation: Operation, stale: Stale<'_>) -> Result<Response> {
        let result = self.call(operation).await;
        self.invalidate(stale).await;
        result
    }

    async fn invalidate_batch(&self, ids: &[String]) {
        for id in ids {
            self.cache.invalidate_message(&self.account, id).await;
        }
        self.cache.invalidate_lists(&self.account).await;
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// List up to `query.max_results` messages, newest first
    ///
    /// Queries that include spam and trash bypass the cache.
    pub async fn list_messages(&self, query: &ListQuery, use_cache: bool) -> Result<Vec<MessageRef>> {
        let cacheable = use_cache && !query.include_spam_trash;
        if cacheable {
            if let Some(mut messages) = self
                .cache
                .get_list(&self.account, &query.query, &query.label_ids)
                .await
            {
                messages.truncate(query.max_results);
                return Ok(messages);
            }
        }

        let generation = self.cache.generation(&self.account);
        let mut messages = Vec::new();
        let mut page_token = None;
        while messages.len() < query.max_results {
            let page_size = (query.max_results - messages.len()).min(MAX_PAGE_SIZE);
            let page = self
                .call(Operation::ListMessages {
                    query: query.clone(),
                    page_size: page_size as u32,
                    page_token: page_token.take(),
                })
                .await?
                .into_message_page()?;

            messages.extend(page.messages);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        messages.truncate(query.max_results);

        if cacheable {
            self.cache
                .set_list(
                    &self.account,
                    &query.query,
                    &query.label_ids,
                    &messages,
                    generation,
                )
                .await;
        }
        debug!("Listed {} messages for {}", messages.len(), self.account);
        Ok(messages)
    }

    /// Fetch one message; full and metadata formats are cached separately
    pub async fn get_message(&self, id: &str, format: MessageFormat, use_cache: bool) -> Result<Message> {
        let cacheable = use_cache && format.is_cacheable();
        let metadata_only = format == MessageFormat::Metadata;

        if cacheable {
            if let Some(message) = self.cache.get_message(&self.account, id, metadata_only).await {
                return Ok(message);
            }
        }

        let generation = self.cache.generation(&self.account);
        let message = self
            .call(Operation::GetMessage {
                id: id.to_string(),
                format,
            })
            .await?
            .into_message()?;

        if cacheable {
            self.cache
                .set_message(&self.account, id, &message, !metadata_only, generation)
                .await;
        }
        Ok(message)
    }

    /// Download one attachment body; attachments are never cached
    pub async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<AttachmentData> {
        self.call(Operation::GetAttachment {
            message_id: message_id.to_string(),
            attachment_id: attachment_id.to_string(),
        })
        .await?
        .into_attachment()
    }

    /// List up to `query.max_results` threads; thread lists are not cached
    pub async fn list_threads(&self, query: &ListQuery) -> Result<Vec<ThreadRef>> {
        let mut threads = Vec::new();
        let mut page_token = None;
        while threads.len() < query.max_results {
            let page_size = (query.max_results - threads.len()).min(MAX_PAGE_SIZE);
            let page = self
                .call(Operation::ListThreads {
                    query: query.clone(),
                    page_size: page_size as u32,
                    page_token: page_token.take(),
                })
                .await?
                .into_thread_page()?;

            threads.extend(page.threads);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        threads.truncate(query.max_results);
        debug!("Listed {} threads for {}", threads.len(), self.account);
        Ok(threads)
    }

    pub async fn get_thread(&self, id: &str, format: MessageFormat) -> Result<Thread> {
        self.call(Operation::GetThread {
            id: id.to_string(),
            format,
        })
        .await?
        .into_thread()
    }

    /// List up to `max` drafts
    pub async fn list_drafts(&self, max: usize) -> Result<Vec<DraftRef>> {
        let mut drafts = Vec::new();
        let mut page_token = None;
        while drafts.len() < max {
            let page_size = (max - drafts.len()).min(MAX_PAGE_SIZE);
            let page = self
                .call(Operation::ListDrafts {
                    page_size: page_size as u32,
                    page_token: page_token.take(),
                })
                .await?
                .into_draft_page()?;

            drafts.extend(page.drafts);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        drafts.truncate(max);
        Ok(drafts)
    }

    pub async fn get_draft(&self, id: &str) -> Result<Draft> {
        self.call(Operation::GetDraft { id: id.to_string() })
            .await?
            .into_draft()
    }

    /// Label counters are always read from the remote
    pub async fn get_label(&self, id: &str) -> Result<LabelDetail> {
        self.call(Operation::GetLabel { id: id.to_string() })
            .await?
            .into_label_detail()
    }

    pub async fn list_labels(&self, use_cache: bool) -> Result<Vec<Label>> {
        if use_cache {
            if let Some(labels) = self.cache.get_labels(&self.account).await {
                return Ok(labels);
            }
        }

        let generation = self.cache.generation(&self.account);
        let labels = self.call(Operation::ListLabels).await?.into_labels()?;
        if use_cache {
            self.cache.set_labels(&self.account, &labels, generation).await;
        }
        Ok(labels)
    }

    pub async fn get_profile(&self) -> Result<Profile> {
        self.call(Operation::GetProfile).await?.into_profile()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub async fn send_message(&self, message: &OutgoingMessage) -> Result<MessageUpdate> {
        let update = self
            .mutate(Operation::SendMessage(message.clone()), Stale::Lists)
            .await?
            .into_update()?;
        info!("Sent message {} from {}", update.id, self.account);
        Ok(update)
    }

    /// Add and remove labels on one message
    pub async fn modify_message(&self, id: &str, change: &LabelChange) -> Result<MessageUpdate> {
        self.mutate(
            Operation::ModifyMessage {
                id: id.to_string(),
                change: change.clone(),
            },
            Stale::MessageAndLists(id),
        )
        .await?
        .into_update()
    }

    pub async fn mark_as_read(&self, id: &str) -> Result<MessageUpdate> {
        self.modify_message(id, &LabelChange::remove(&["UNREAD"])).await
    }

    pub async fn mark_as_unread(&self, id: &str) -> Result<MessageUpdate> {
        self.modify_message(id, &LabelChange::add(&["UNREAD"])).await
    }

    pub async fn star(&self, id: &str) -> Result<MessageUpdate> {
        self.modify_message(id, &LabelChange::add(&["STARRED"])).await
    }

    pub async fn unstar(&self, id: &str) -> Result<MessageUpdate> {
        self.modify_message(id, &LabelChange::remove(&["STARRED"])).await
    }

    pub async fn archive(&self, id: &str) -> Result<MessageUpdate> {
        self.modify_message(id, &LabelChange::remove(&["INBOX"])).await
    }

    pub async fn trash_message(&self, id: &str) -> Result<MessageUpdate> {
        self.mutate(
            Operation::TrashMessage { id: id.to_string() },
            Stale::MessageAndLists(id),
        )
        .await?
        .into_update()
    }

    pub async fn untrash_message(&self, id: &str) -> Result<MessageUpdate> {
        self.mutate(
            Operation::UntrashMessage { id: id.to_string() },
            Stale::MessageAndLists(id),
        )
        .await?
        .into_update()
    }

    /// Permanently delete one message
    pub async fn delete_message(&self, id: &str) -> Result<MessageUpdate> {
        let update = self
            .mutate(
                Operation::DeleteMessage { id: id.to_string() },
                Stale::MessageAndLists(id),
            )
            .await?
            .into_update()?;
        info!("Permanently deleted message {} for {}", id, self.account);
        Ok(update)
    }

    pub async fn create_label(&self, label: &NewLabel) -> Result<Label> {
        self.mutate(Operation::CreateLabel(label.clone()), Stale::Labels)
            .await?
            .into_label()
    }

    /// Rename a label or change its visibility
    pub async fn update_label(&self, id: &str, update: &LabelUpdate) -> Result<Label> {
        if update.is_empty() {
            return Err(GmailError::LabelError(format!(
                "nothing to update on label {}",
                id
            )));
        }
        self.mutate(
            Operation::UpdateLabel {
                id: id.to_string(),
                update: update.clone(),
            },
            Stale::Labels,
        )
        .await?
        .into_label()
    }

    /// Move every message of a thread to the trash
    ///
    /// The thread's member ids are not known up front, so every cached
    /// message of the account is dropped.
    pub async fn trash_thread(&self, id: &str) -> Result<Thread> {
        self.mutate(Operation::TrashThread { id: id.to_string() }, Stale::AllMessages)
            .await?
            .into_thread()
    }

    pub async fn create_draft(&self, message: &OutgoingMessage) -> Result<Draft> {
        let draft = self
            .mutate(Operation::CreateDraft(message.clone()), Stale::Lists)
            .await?
            .into_draft()?;
        debug!("Created draft {} for {}", draft.id, self.account);
        Ok(draft)
    }

    pub async fn send_draft(&self, id: &str) -> Result<MessageUpdate> {
        let update = self
            .mutate(Operation::SendDraft { id: id.to_string() }, Stale::Lists)
            .await?
            .into_update()?;
        info!("Sent draft {} as message {} from {}", id, update.id, self.account);
        Ok(update)
    }

    pub async fn delete_draft(&self, id: &str) -> Result<()> {
        self.mutate(Operation::DeleteDraft { id: id.to_string() }, Stale::Lists)
            .await?;
        Ok(())
    }

    pub async fn delete_label(&self, id: &str) -> Result<()> {
        self.mutate(Operation::DeleteLabel { id: id.to_string() }, Stale::Labels)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    pub async fn batch_get_messages(&self, ids: &[String], format: MessageFormat) -> BatchResult<Message> {
        self.batch.batch_get(&self.account, ids, format).await
    }

    pub async fn batch_modify_labels(
        &self,
        ids: &[String],
        change: &LabelChange,
    ) -> BatchResult<MessageUpdate> {
        let result = self
            .batch
            .batch_modify_labels(&self.account, ids, change)
            .await;
        self.invalidate_batch(ids).await;
        result
    }

    pub async fn batch_trash_messages(&self, ids: &[String]) -> BatchResult<MessageUpdate> {
        let result = self.batch.batch_trash(&self.account, ids).await;
        self.invalidate_batch(ids).await;
        result
    }

    pub async fn batch_delete_messages(&self, ids: &[String]) -> BatchResult<MessageUpdate> {
        let result = self.batch.batch_delete(&self.account, ids).await;
        self.invalidate_batch(ids).await;
        result
    }

    /// Mark messages matching `query` (default `is:unread`) as read
    ///
    /// At most `max` messages are touched, defaulting to the configured cap.
    pub async fn mark_all_as_read(
        &self,
        query: Option<&str>,
        max: Option<usize>,
    ) -> Result<BatchResult<MessageUpdate>> {
        let query = query.unwrap_or(DEFAULT_UNREAD_QUERY);
        let max = max.unwrap_or(self.max_messages);
        let (ids, result) = self.batch.mark_all_as_read(&self.account, query, max).await?;
        self.invalidate_batch(&ids).await;
        Ok(result)
    }

    /// Archive inbox messages matching `query`
    pub async fn archive_all(
        &self,
        query: Option<&str>,
        max: Option<usize>,
    ) -> Result<BatchResult<MessageUpdate>> {
        let max = max.unwrap_or(self.max_messages);
        let (ids, result) = self
            .batch
            .archive_all(&self.account, query.unwrap_or_default(), max)
            .await?;
        self.invalidate_batch(&ids).await;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub async fn quota_status(&self) -> QuotaUsage {
        self.executor.quota().get_usage(&self.account).await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.get_stats(&self.account).await
    }

    /// Drop everything cached for this account
    pub async fn clear_cache(&self) -> usize {
        let removed = self.cache.invalidate_account(&self.account).await;
        info!("Cache cleared for account {} ({} entries)", self.account, removed);
        removed
    }
}
