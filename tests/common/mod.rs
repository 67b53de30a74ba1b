//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use gmail_resilience::cache::{CacheTtls, MemoryStore, ResponseCache};
use gmail_resilience::error::{GmailError, Result};
use gmail_resilience::executor::CallExecutor;
use gmail_resilience::models::{
    AttachmentData, Draft, DraftPage, DraftRef, Label, LabelDetail, Message, MessagePage,
    MessageRef, MessageUpdate, OperationKind, Profile, Thread, ThreadPage, ThreadRef,
    UpdateStatus,
};
use gmail_resilience::quota::QuotaManager;
use gmail_resilience::remote::{Operation, RemoteService, Response};
use gmail_resilience::retry::RetryPolicy;
use gmail_resilience::service::MailService;
use mockall::mock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Create a test message with default values
pub fn create_test_message(id: &str, from: &str, subject: &str) -> Message {
    Message {
        id: id.to_string(),
        thread_id: format!("thread_{}", id),
        label_ids: vec!["INBOX".to_string(), "UNREAD".to_string()],
        snippet: format!("Snippet of {}", subject),
        from: from.to_string(),
        to: "me@example.com".to_string(),
        subject: subject.to_string(),
        date: "Mon, 1 Jan 2024 10:00:00 +0000".to_string(),
        body: format!("Body of {}", subject),
        ..Default::default()
    }
}

pub fn create_test_ref(id: &str) -> MessageRef {
    MessageRef {
        id: id.to_string(),
        thread_id: format!("thread_{}", id),
    }
}

/// A page holding `ids`, optionally pointing at a next page
pub fn create_test_page(ids: &[&str], next_page_token: Option<&str>) -> MessagePage {
    MessagePage {
        messages: ids.iter().map(|id| create_test_ref(id)).collect(),
        next_page_token: next_page_token.map(str::to_string),
    }
}

pub fn create_test_label(id: &str, name: &str) -> Label {
    Label {
        id: id.to_string(),
        name: name.to_string(),
        label_type: "user".to_string(),
        message_list_visibility: Some("show".to_string()),
        label_list_visibility: Some("labelShow".to_string()),
    }
}

pub fn create_test_update(id: &str, status: UpdateStatus) -> MessageUpdate {
    MessageUpdate {
        id: id.to_string(),
        thread_id: Some(format!("thread_{}", id)),
        label_ids: Vec::new(),
        status,
    }
}

pub fn create_test_thread(id: &str, message_ids: &[&str]) -> Thread {
    Thread {
        id: id.to_string(),
        snippet: format!("Snippet of {}", id),
        history_id: "1234".to_string(),
        messages: message_ids
            .iter()
            .map(|m| Message {
                thread_id: id.to_string(),
                ..create_test_message(m, "alice@example.com", "Hello")
            })
            .collect(),
    }
}

pub fn create_test_draft(id: &str) -> Draft {
    Draft {
        id: id.to_string(),
        message: Message {
            label_ids: vec!["DRAFT".to_string()],
            ..create_test_message(&format!("msg_{}", id), "me@example.com", "Draft")
        },
    }
}

/// A plausible successful response for `operation`
pub fn default_response(operation: &Operation) -> Response {
    match operation {
        Operation::ListMessages { .. } => Response::MessagePage(create_test_page(&["m1", "m2"], None)),
        Operation::GetMessage { id, .. } => {
            Response::Message(create_test_message(id, "alice@example.com", "Hello"))
        }
        Operation::SendMessage(_) => Response::Updated(create_test_update("sent-1", UpdateStatus::Sent)),
        Operation::ModifyMessage { id, change } => Response::Updated(MessageUpdate {
            label_ids: change.add.clone(),
            ..create_test_update(id, UpdateStatus::Modified)
        }),
        Operation::TrashMessage { id } => Response::Updated(create_test_update(id, UpdateStatus::Trashed)),
        Operation::UntrashMessage { id } => {
            Response::Updated(create_test_update(id, UpdateStatus::Untrashed))
        }
        Operation::DeleteMessage { id } => Response::Updated(create_test_update(id, UpdateStatus::Deleted)),
        Operation::GetAttachment {
            attachment_id, ..
        } => Response::Attachment(AttachmentData {
            attachment_id: attachment_id.clone(),
            size: 5,
            data: b"hello".to_vec(),
        }),
        Operation::ListThreads { .. } => Response::ThreadPage(ThreadPage {
            threads: vec![
                ThreadRef {
                    id: "t1".to_string(),
                    ..Default::default()
                },
                ThreadRef {
                    id: "t2".to_string(),
                    ..Default::default()
                },
            ],
            next_page_token: None,
        }),
        Operation::GetThread { id, .. } | Operation::TrashThread { id } => {
            Response::Thread(create_test_thread(id, &["m1", "m2"]))
        }
        Operation::ListDrafts { .. } => Response::DraftPage(DraftPage {
            drafts: vec![DraftRef {
                id: "d1".to_string(),
                message: create_test_ref("msg_d1"),
            }],
            next_page_token: None,
        }),
        Operation::GetDraft { id } => Response::Draft(create_test_draft(id)),
        Operation::CreateDraft(_) => Response::Draft(create_test_draft("d-new")),
        Operation::SendDraft { id } => {
            Response::Updated(create_test_update(&format!("sent_{}", id), UpdateStatus::Sent))
        }
        Operation::DeleteDraft { .. } => Response::Empty,
        Operation::ListLabels => Response::Labels(vec![
            create_test_label("INBOX", "INBOX"),
            create_test_label("Label_1", "Receipts"),
        ]),
        Operation::GetLabel { id } => Response::LabelDetail(LabelDetail {
            label: create_test_label(id, "Receipts"),
            messages_total: 12,
            messages_unread: 3,
            threads_total: 10,
            threads_unread: 2,
        }),
        Operation::CreateLabel(label) => Response::Label(create_test_label("Label_new", &label.name)),
        Operation::UpdateLabel { id, update } => Response::Label(create_test_label(
            id,
            update.name.as_deref().unwrap_or("Receipts"),
        )),
        Operation::DeleteLabel { .. } => Response::Empty,
        Operation::GetProfile => Response::Profile(Profile {
            email: "me@example.com".to_string(),
            messages_total: 42,
            threads_total: 40,
            history_id: "1234".to_string(),
        }),
    }
}

type Handler = dyn Fn(&Operation) -> Option<Result<Response>> + Send + Sync;

/// In-memory remote that records every invocation
///
/// Operations answer with [`default_response`] unless a handler, a queued
/// failure for the target message, or a permanent failure overrides it.
#[derive(Default)]
pub struct ScriptedRemote {
    calls: Mutex<Vec<Operation>>,
    handler: Option<Box<Handler>>,
    /// Errors returned, in order, for the next calls on a message id
    transient: Mutex<HashMap<String, Vec<GmailError>>>,
    /// Message ids whose every call fails with a 404
    missing: Mutex<Vec<String>>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer with `handler` when it returns `Some`, else the defaults
    pub fn with_handler<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Operation) -> Option<Result<Response>> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Some(Box::new(handler)),
            ..Default::default()
        })
    }

    pub fn fail_then_succeed(&self, id: &str, errors: Vec<GmailError>) {
        self.transient
            .lock()
            .unwrap()
            .insert(id.to_string(), errors);
    }

    pub fn mark_missing(&self, id: &str) {
        self.missing.lock().unwrap().push(id.to_string());
    }

    pub fn calls(&self) -> Vec<Operation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn count_of(&self, kind: OperationKind) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.kind() == kind)
            .count()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl RemoteService for ScriptedRemote {
    async fn invoke(&self, operation: &Operation) -> Result<Response> {
        self.calls.lock().unwrap().push(operation.clone());

        if let Some(id) = operation.message_id() {
            if self.missing.lock().unwrap().iter().any(|m| m == id) {
                return Err(GmailError::MessageNotFound(id.to_string()));
            }
            let mut transient = self.transient.lock().unwrap();
            if let Some(errors) = transient.get_mut(id) {
                if !errors.is_empty() {
                    return Err(errors.remove(0));
                }
            }
        }

        if let Some(handler) = &self.handler {
            if let Some(result) = handler(operation) {
                return result;
            }
        }
        Ok(default_response(operation))
    }
}

// Mock implementation of RemoteService for expectation-style tests
mock! {
    pub Remote {}

    #[async_trait]
    impl RemoteService for Remote {
        async fn invoke(&self, operation: &Operation) -> Result<Response>;
    }
}

/// Fast retries so failing tests do not sleep for real
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::exponential(3, Duration::from_millis(1), 2.0)
}

pub fn memory_cache() -> ResponseCache {
    ResponseCache::new(Arc::new(MemoryStore::new(1_000)), CacheTtls::default())
}

/// Service for account "work" over `remote` with a memory cache
pub fn create_test_service(remote: Arc<dyn RemoteService>) -> MailService {
    create_test_service_with(
        remote,
        QuotaManager::with_limits(250, Duration::from_secs(1), Duration::from_millis(10)),
        memory_cache(),
    )
}

pub fn create_test_service_with(
    remote: Arc<dyn RemoteService>,
    quota: QuotaManager,
    cache: ResponseCache,
) -> MailService {
    let executor = CallExecutor::new(remote, quota, fast_retry());
    MailService::new("work", executor, cache, 4, 500)
}
