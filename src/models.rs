use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{GmailError, Result};

/// Gmail API operation kinds and their quota-unit cost
///
/// The table is fixed and process-wide; see
/// <https://developers.google.com/gmail/api/reference/quota>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    MessagesList,
    MessagesGet,
    MessagesSend,
    MessagesModify,
    MessagesTrash,
    MessagesUntrash,
    MessagesDelete,
    AttachmentsGet,
    ThreadsList,
    ThreadsGet,
    ThreadsTrash,
    DraftsList,
    DraftsGet,
    DraftsCreate,
    DraftsSend,
    DraftsDelete,
    LabelsList,
    LabelsGet,
    LabelsCreate,
    LabelsPatch,
    LabelsDelete,
    ProfileGet,
}

impl OperationKind {
    /// Quota units consumed by one call of this kind
    pub fn cost(&self) -> i64 {
        match self {
            OperationKind::MessagesList => 5,
            OperationKind::MessagesGet => 5,
            OperationKind::MessagesSend => 100,
            OperationKind::MessagesModify => 5,
            OperationKind::MessagesTrash => 5,
            OperationKind::MessagesUntrash => 5,
            OperationKind::MessagesDelete => 10,
            OperationKind::AttachmentsGet => 5,
            OperationKind::ThreadsList => 10,
            OperationKind::ThreadsGet => 10,
            OperationKind::ThreadsTrash => 10,
            OperationKind::DraftsList => 5,
            OperationKind::DraftsGet => 5,
            OperationKind::DraftsCreate => 10,
            OperationKind::DraftsSend => 100,
            OperationKind::DraftsDelete => 10,
            OperationKind::LabelsList => 1,
            OperationKind::LabelsGet => 1,
            OperationKind::LabelsCreate => 5,
            OperationKind::LabelsPatch => 5,
            OperationKind::LabelsDelete => 5,
            OperationKind::ProfileGet => 1,
        }
    }

    /// API method name, as used in log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::MessagesList => "messages.list",
            OperationKind::MessagesGet => "messages.get",
            OperationKind::MessagesSend => "messages.send",
            OperationKind::MessagesModify => "messages.modify",
            OperationKind::MessagesTrash => "messages.trash",
            OperationKind::MessagesUntrash => "messages.untrash",
            OperationKind::MessagesDelete => "messages.delete",
            OperationKind::AttachmentsGet => "messages.attachments.get",
            OperationKind::ThreadsList => "threads.list",
            OperationKind::ThreadsGet => "threads.get",
            OperationKind::ThreadsTrash => "threads.trash",
            OperationKind::DraftsList => "drafts.list",
            OperationKind::DraftsGet => "drafts.get",
            OperationKind::DraftsCreate => "drafts.create",
            OperationKind::DraftsSend => "drafts.send",
            OperationKind::DraftsDelete => "drafts.delete",
            OperationKind::LabelsList => "labels.list",
            OperationKind::LabelsGet => "labels.get",
            OperationKind::LabelsCreate => "labels.create",
            OperationKind::LabelsPatch => "labels.patch",
            OperationKind::LabelsDelete => "labels.delete",
            OperationKind::ProfileGet => "users.getProfile",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response format for messages.get
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    Minimal,
    #[default]
    Full,
    Raw,
    Metadata,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Minimal => "minimal",
            MessageFormat::Full => "full",
            MessageFormat::Raw => "raw",
            MessageFormat::Metadata => "metadata",
        }
    }

    /// Only full and metadata responses are cached
    pub fn is_cacheable(&self) -> bool {
        matches!(self, MessageFormat::Full | MessageFormat::Metadata)
    }
}

/// Message reference as returned by messages.list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: String,
}

/// One page of messages.list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessageRef>,
    pub next_page_token: Option<String>,
}

/// Parameters of a message list query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub query: String,
    pub label_ids: Vec<String>,
    pub max_results: usize,
    pub include_spam_trash: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            label_ids: Vec::new(),
            max_results: 20,
            include_spam_trash: false,
        }
    }
}

impl ListQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, label_ids: Vec<String>) -> Self {
        self.label_ids = label_ids;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

/// Attachment descriptor (body is fetched separately)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size: i32,
    pub attachment_id: Option<String>,
}

/// Downloaded attachment body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentData {
    pub attachment_id: String,
    pub size: i32,
    /// Decoded bytes
    pub data: Vec<u8>,
}

/// Parsed message detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub label_ids: Vec<String>,
    pub snippet: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub date: String,
    pub message_id: String,
    /// Plain text body, falling back to the HTML body
    pub body: String,
    pub body_html: String,
    pub attachments: Vec<Attachment>,
    pub size_estimate: i32,
    pub internal_date: Option<i64>,
}

/// Thread summary as returned by threads.list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ThreadRef {
    pub id: String,
    pub snippet: String,
    pub history_id: String,
}

/// One page of threads.list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPage {
    pub threads: Vec<ThreadRef>,
    pub next_page_token: Option<String>,
}

/// A conversation and its messages, oldest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Thread {
    pub id: String,
    pub snippet: String,
    pub history_id: String,
    pub messages: Vec<Message>,
}

/// Draft summary as returned by drafts.list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftRef {
    pub id: String,
    pub message: MessageRef,
}

/// One page of drafts.list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftPage {
    pub drafts: Vec<DraftRef>,
    pub next_page_token: Option<String>,
}

/// A draft with its parsed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
    pub message: Message,
}

/// Label summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub label_type: String,
    pub message_list_visibility: Option<String>,
    pub label_list_visibility: Option<String>,
}

/// Label creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLabel {
    pub name: String,
    pub message_list_visibility: String,
    pub label_list_visibility: String,
}

impl NewLabel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message_list_visibility: "show".to_string(),
            label_list_visibility: "labelShow".to_string(),
        }
    }
}

/// Label with its message and thread counters, from labels.get
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelDetail {
    #[serde(flatten)]
    pub label: Label,
    pub messages_total: i32,
    pub messages_unread: i32,
    pub threads_total: i32,
    pub threads_unread: i32,
}

/// Partial label update for labels.patch; `None` fields are left alone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LabelUpdate {
    pub name: Option<String>,
    pub message_list_visibility: Option<String>,
    pub label_list_visibility: Option<String>,
}

impl LabelUpdate {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.message_list_visibility.is_none()
            && self.label_list_visibility.is_none()
    }
}

/// Account profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub email: String,
    pub messages_total: i32,
    pub threads_total: i32,
    pub history_id: String,
}

/// File attached to an outgoing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl OutgoingAttachment {
    /// Read `path`, guessing the content type from its extension
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                GmailError::InvalidMessageFormat(format!("attachment path {:?} has no file name", path))
            })?
            .to_string();
        let data = tokio::fs::read(path).await?;
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self {
            filename,
            content_type,
            data,
        })
    }
}

/// Plain-text or HTML message to send or save as a draft
///
/// Address fields hold comma-separated lists of `addr@host` or
/// `Display Name <addr@host>` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub html: bool,
    pub in_reply_to: Option<String>,
    pub thread_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<OutgoingAttachment>,
}

/// Label changes applied by messages.modify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LabelChange {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl LabelChange {
    pub fn add(labels: &[&str]) -> Self {
        Self {
            add: labels.iter().map(|l| l.to_string()).collect(),
            remove: Vec::new(),
        }
    }

    pub fn remove(labels: &[&str]) -> Self {
        Self {
            add: Vec::new(),
            remove: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Outcome of a single mutating call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub id: String,
    pub thread_id: Option<String>,
    pub label_ids: Vec<String>,
    pub status: UpdateStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Sent,
    Modified,
    Trashed,
    Untrashed,
    Deleted,
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateStatus::Sent => "sent",
            UpdateStatus::Modified => "modified",
            UpdateStatus::Trashed => "trashed",
            UpdateStatus::Untrashed => "untrashed",
            UpdateStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}
