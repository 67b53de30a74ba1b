//! Integration tests for MailService caching and invalidation

mod common;

use async_trait::async_trait;
use common::*;
use gmail_resilience::cache::ResponseCache;
use gmail_resilience::config::{CacheBackend, CacheConfig, Config};
use gmail_resilience::error::GmailError;
use gmail_resilience::error::Result;
use gmail_resilience::models::{
    LabelChange, ListQuery, MessageFormat, MessageUpdate, NewLabel, OperationKind,
    OutgoingMessage, Profile, UpdateStatus,
};
use gmail_resilience::quota::QuotaManager;
use gmail_resilience::remote::{Operation, RemoteService, Response};
use gmail_resilience::service::MailService;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

fn unread() -> ListQuery {
    ListQuery::new("is:unread").with_max_results(10)
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn test_list_served_from_cache() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    let first = service.list_messages(&unread(), true).await.unwrap();
    let second = service.list_messages(&unread(), true).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(remote.count_of(OperationKind::MessagesList), 1);

    let stats = service.cache_stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.list_entries, 1);
}

#[tokio::test]
async fn test_list_without_cache_always_calls_remote() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    service.list_messages(&unread(), false).await.unwrap();
    service.list_messages(&unread(), false).await.unwrap();

    assert_eq!(remote.count_of(OperationKind::MessagesList), 2);
    assert_eq!(service.cache_stats().await.list_entries, 0);
}

#[tokio::test]
async fn test_label_order_does_not_split_cache_entries() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    let a = ListQuery::new("").with_labels(vec!["INBOX".into(), "UNREAD".into()]);
    let b = ListQuery::new("").with_labels(vec!["UNREAD".into(), "INBOX".into()]);
    service.list_messages(&a, true).await.unwrap();
    service.list_messages(&b, true).await.unwrap();

    assert_eq!(remote.count_of(OperationKind::MessagesList), 1);
}

#[tokio::test]
async fn test_spam_and_trash_queries_bypass_cache() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    let mut query = unread();
    query.include_spam_trash = true;
    service.list_messages(&query, true).await.unwrap();
    service.list_messages(&query, true).await.unwrap();

    assert_eq!(remote.count_of(OperationKind::MessagesList), 2);
}

#[tokio::test]
async fn test_list_follows_page_tokens() {
    let remote = ScriptedRemote::with_handler(|op| match op {
        Operation::ListMessages { page_token, .. } => Some(Ok(Response::MessagePage(
            match page_token.as_deref() {
                None => create_test_page(&["m1", "m2"], Some("p2")),
                Some("p2") => create_test_page(&["m3", "m4"], Some("p3")),
                _ => create_test_page(&["m5"], None),
            },
        ))),
        _ => None,
    });
    let service = create_test_service(remote.clone());

    let refs = service
        .list_messages(&ListQuery::new("").with_max_results(3), true)
        .await
        .unwrap();

    let ids: Vec<&str> = refs.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
    assert_eq!(remote.count_of(OperationKind::MessagesList), 2);
}

#[tokio::test]
async fn test_full_and_metadata_are_cached_separately() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    service.get_message("m1", MessageFormat::Metadata, true).await.unwrap();
    service.get_message("m1", MessageFormat::Full, true).await.unwrap();
    assert_eq!(remote.count_of(OperationKind::MessagesGet), 2);

    service.get_message("m1", MessageFormat::Metadata, true).await.unwrap();
    service.get_message("m1", MessageFormat::Full, true).await.unwrap();
    assert_eq!(remote.count_of(OperationKind::MessagesGet), 2);

    let stats = service.cache_stats().await;
    assert_eq!(stats.message_entries, 1);
    assert_eq!(stats.metadata_entries, 1);
}

#[tokio::test]
async fn test_raw_format_is_never_cached() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    service.get_message("m1", MessageFormat::Raw, true).await.unwrap();
    service.get_message("m1", MessageFormat::Raw, true).await.unwrap();

    assert_eq!(remote.count_of(OperationKind::MessagesGet), 2);
}

#[tokio::test]
async fn test_labels_cached_until_label_created() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    let labels = service.list_labels(true).await.unwrap();
    assert_eq!(labels.len(), 2);
    service.list_labels(true).await.unwrap();
    assert_eq!(remote.count_of(OperationKind::LabelsList), 1);

    let created = service.create_label(&NewLabel::new("Projects")).await.unwrap();
    assert_eq!(created.name, "Projects");

    service.list_labels(true).await.unwrap();
    assert_eq!(remote.count_of(OperationKind::LabelsList), 2);
}

// ============================================================================
// Invalidation
// ============================================================================

#[tokio::test]
async fn test_modify_invalidates_message_and_lists() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    service.list_messages(&unread(), true).await.unwrap();
    service.get_message("m1", MessageFormat::Full, true).await.unwrap();
    service.get_message("m2", MessageFormat::Full, true).await.unwrap();

    service.mark_as_read("m1").await.unwrap();

    service.list_messages(&unread(), true).await.unwrap();
    service.get_message("m1", MessageFormat::Full, true).await.unwrap();
    service.get_message("m2", MessageFormat::Full, true).await.unwrap();

    assert_eq!(remote.count_of(OperationKind::MessagesList), 2);
    // m1 refetched, m2 still cached
    assert_eq!(remote.count_of(OperationKind::MessagesGet), 3);
}

#[tokio::test]
async fn test_failed_mutation_still_invalidates() {
    let remote = ScriptedRemote::with_handler(|op| match op {
        Operation::TrashMessage { .. } => Some(Err(GmailError::Forbidden("no".to_string()))),
        _ => None,
    });
    let service = create_test_service(remote.clone());

    service.get_message("m1", MessageFormat::Full, true).await.unwrap();
    service.list_messages(&unread(), true).await.unwrap();

    let err = service.trash_message("m1").await.unwrap_err();
    assert!(matches!(err, GmailError::Forbidden(_)));

    service.get_message("m1", MessageFormat::Full, true).await.unwrap();
    service.list_messages(&unread(), true).await.unwrap();
    assert_eq!(remote.count_of(OperationKind::MessagesGet), 2);
    assert_eq!(remote.count_of(OperationKind::MessagesList), 2);
}

/// Remote holding one message's labels; the first fetch parks after
/// reading them until `release` is notified
struct GatedRemote {
    labels: Mutex<Vec<String>>,
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl GatedRemote {
    fn new(labels: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            labels: Mutex::new(labels.iter().map(|l| l.to_string()).collect()),
            gated: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl RemoteService for GatedRemote {
    async fn invoke(&self, operation: &Operation) -> Result<Response> {
        match operation {
            Operation::GetMessage { id, .. } => {
                let label_ids = self.labels.lock().unwrap().clone();
                if self.gated.swap(false, Ordering::SeqCst) {
                    self.entered.notify_one();
                    self.release.notified().await;
                }
                Ok(Response::Message(gmail_resilience::models::Message {
                    label_ids,
                    ..create_test_message(id, "alice@example.com", "Hello")
                }))
            }
            Operation::ModifyMessage { id, change } => {
                let mut labels = self.labels.lock().unwrap();
                labels.retain(|label| !change.remove.contains(label));
                labels.extend(change.add.iter().cloned());
                Ok(Response::Updated(MessageUpdate {
                    id: id.clone(),
                    thread_id: None,
                    label_ids: labels.clone(),
                    status: UpdateStatus::Modified,
                }))
            }
            other => Ok(default_response(other)),
        }
    }
}

#[tokio::test]
async fn test_read_in_flight_during_mutation_does_not_repopulate_cache() {
    let remote = GatedRemote::new(&["INBOX", "UNREAD"]);
    let service = create_test_service(remote.clone());

    let reader = {
        let service = service.clone();
        tokio::spawn(async move { service.get_message("m1", MessageFormat::Full, true).await })
    };
    remote.entered.notified().await;

    service.mark_as_read("m1").await.unwrap();
    remote.release.notify_one();

    let in_flight = reader.await.unwrap().unwrap();
    assert!(in_flight.label_ids.contains(&"UNREAD".to_string()));

    let cached = service.get_message("m1", MessageFormat::Full, true).await.unwrap();
    assert_eq!(cached.label_ids, vec!["INBOX".to_string()]);
}

#[tokio::test]
async fn test_send_invalidates_lists_only() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    service.list_messages(&unread(), true).await.unwrap();
    service.get_message("m1", MessageFormat::Full, true).await.unwrap();

    let update = service
        .send_message(&OutgoingMessage {
            to: "bob@example.com".to_string(),
            subject: "Hi".to_string(),
            body: "Hello Bob".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(update.id, "sent-1");

    service.list_messages(&unread(), true).await.unwrap();
    service.get_message("m1", MessageFormat::Full, true).await.unwrap();
    assert_eq!(remote.count_of(OperationKind::MessagesList), 2);
    assert_eq!(remote.count_of(OperationKind::MessagesGet), 1);
}

#[tokio::test]
async fn test_accounts_do_not_share_entries() {
    let remote = ScriptedRemote::new();
    let work = create_test_service(remote.clone());
    let home = work.for_account("home");

    work.list_messages(&unread(), true).await.unwrap();
    home.list_messages(&unread(), true).await.unwrap();
    assert_eq!(remote.count_of(OperationKind::MessagesList), 2);

    assert_eq!(home.clear_cache().await, 1);
    work.list_messages(&unread(), true).await.unwrap();
    assert_eq!(remote.count_of(OperationKind::MessagesList), 2);
}

#[tokio::test]
async fn test_clear_cache_forces_refetch() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    service.list_messages(&unread(), true).await.unwrap();
    service.get_message("m1", MessageFormat::Full, true).await.unwrap();
    service.list_labels(true).await.unwrap();

    assert_eq!(service.clear_cache().await, 3);
    assert_eq!(service.cache_stats().await.total_entries(), 0);

    service.list_labels(true).await.unwrap();
    assert_eq!(remote.count_of(OperationKind::LabelsList), 2);
}

#[tokio::test]
async fn test_file_cache_survives_new_service() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig {
        backend: CacheBackend::File,
        dir: dir.path().to_path_buf(),
        ..Default::default()
    };

    let first_remote = ScriptedRemote::new();
    let first = create_test_service_with(
        first_remote.clone(),
        QuotaManager::disabled(),
        ResponseCache::from_config(&config),
    );
    first.get_message("m1", MessageFormat::Full, true).await.unwrap();

    let second_remote = ScriptedRemote::new();
    let second = create_test_service_with(
        second_remote.clone(),
        QuotaManager::disabled(),
        ResponseCache::from_config(&config),
    );
    let message = second.get_message("m1", MessageFormat::Full, true).await.unwrap();

    assert_eq!(message.id, "m1");
    assert_eq!(second_remote.call_count(), 0);
}

// ============================================================================
// Quota and retry through the service
// ============================================================================

#[tokio::test]
async fn test_quota_usage_reflects_calls() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    service.list_messages(&unread(), true).await.unwrap();
    service.list_messages(&unread(), true).await.unwrap(); // cache hit, free
    service.get_message("m1", MessageFormat::Full, true).await.unwrap();
    service.list_labels(true).await.unwrap();

    let usage = service.quota_status().await;
    assert_eq!(usage.used, 11);
    assert_eq!(usage.remaining, 239);
    assert_eq!(usage.total_operations, 3);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let remote = ScriptedRemote::new();
    remote.fail_then_succeed(
        "m1",
        vec![
            GmailError::ServerError {
                status: 503,
                message: "backend".to_string(),
            },
            GmailError::NetworkError("reset".to_string()),
        ],
    );
    let service = create_test_service(remote.clone());

    let message = service.get_message("m1", MessageFormat::Full, true).await.unwrap();

    assert_eq!(message.id, "m1");
    assert_eq!(remote.count_of(OperationKind::MessagesGet), 3);
    assert_eq!(service.quota_status().await.used, 5);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let remote = ScriptedRemote::new();
    remote.mark_missing("gone");
    let service = create_test_service(remote.clone());

    let err = service
        .get_message("gone", MessageFormat::Full, true)
        .await
        .unwrap_err();

    assert!(matches!(err, GmailError::MessageNotFound(_)));
    assert_eq!(remote.call_count(), 1);
    assert_eq!(service.quota_status().await.used, 0);
}

#[tokio::test]
async fn test_modify_sends_label_change() {
    let remote = ScriptedRemote::new();
    let service = create_test_service(remote.clone());

    service.archive("m7").await.unwrap();
    service.star("m7").await.unwrap();

    let calls = remote.calls();
    assert_eq!(
        calls[0],
        Operation::ModifyMessage {
            id: "m7".to_string(),
            change: LabelChange::remove(&["INBOX"]),
        }
    );
    assert_eq!(
        calls[1],
        Operation::ModifyMessage {
            id: "m7".to_string(),
            change: LabelChange::add(&["STARRED"]),
        }
    );
}

#[tokio::test]
async fn test_profile_with_mock_remote() {
    let mut mock = MockRemote::new();
    mock.expect_invoke()
        .withf(|op| *op == Operation::GetProfile)
        .times(1)
        .returning(|_| {
            Ok(Response::Profile(Profile {
                email: "someone@example.com".to_string(),
                messages_total: 3,
                threads_total: 2,
                history_id: "9".to_string(),
            }))
        });

    let service = create_test_service(Arc::new(mock));
    let profile = service.get_profile().await.unwrap();

    assert_eq!(profile.email, "someone@example.com");
}

#[tokio::test]
async fn test_from_config_disables_cache_and_quota() {
    let mut config = Config::default();
    config.cache.enabled = false;
    config.quota.enabled = false;

    let remote = ScriptedRemote::new();
    let service = MailService::from_config("work", remote.clone(), &config);

    service.list_messages(&unread(), true).await.unwrap();
    service.list_messages(&unread(), true).await.unwrap();

    assert_eq!(remote.count_of(OperationKind::MessagesList), 2);
    assert!(!service.quota_status().await.enabled);
    assert!(!service.cache_stats().await.enabled);
}
