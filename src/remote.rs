//! Boundary to the remote mail service
//!
//! The resilience layer only ever calls [`RemoteService::invoke`]. Transport,
//! credentials and wire encoding live behind this trait.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{GmailError, Result};
use crate::models::{
    AttachmentData, Draft, DraftPage, Label, LabelChange, LabelDetail, LabelUpdate, ListQuery,
    Message, MessageFormat, MessagePage, MessageUpdate, NewLabel, OperationKind,
    OutgoingMessage, Profile, Thread, ThreadPage,
};

/// Descriptor of a single remote call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ListMessages {
        query: ListQuery,
        page_size: u32,
        page_token: Option<String>,
    },
    GetMessage {
        id: String,
        format: MessageFormat,
    },
    SendMessage(OutgoingMessage),
    ModifyMessage {
        id: String,
        change: LabelChange,
    },
    TrashMessage {
        id: String,
    },
    UntrashMessage {
        id: String,
    },
    DeleteMessage {
        id: String,
    },
    GetAttachment {
        message_id: String,
        attachment_id: String,
    },
    ListThreads {
        query: ListQuery,
        page_size: u32,
        page_token: Option<String>,
    },
    GetThread {
        id: String,
        format: MessageFormat,
    },
    TrashThread {
        id: String,
    },
    ListDrafts {
        page_size: u32,
        page_token: Option<String>,
    },
    GetDraft {
        id: String,
    },
    CreateDraft(OutgoingMessage),
    SendDraft {
        id: String,
    },
    DeleteDraft {
        id: String,
    },
    ListLabels,
    GetLabel {
        id: String,
    },
    CreateLabel(NewLabel),
    UpdateLabel {
        id: String,
        update: LabelUpdate,
    },
    DeleteLabel {
        id: String,
    },
    GetProfile,
}

impl Operation {
    /// Operation kind, used for the quota cost lookup
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::ListMessages { .. } => OperationKind::MessagesList,
            Operation::GetMessage { .. } => OperationKind::MessagesGet,
            Operation::SendMessage(_) => OperationKind::MessagesSend,
            Operation::ModifyMessage { .. } => OperationKind::MessagesModify,
            Operation::TrashMessage { .. } => OperationKind::MessagesTrash,
            Operation::UntrashMessage { .. } => OperationKind::MessagesUntrash,
            Operation::DeleteMessage { .. } => OperationKind::MessagesDelete,
            Operation::GetAttachment { .. } => OperationKind::AttachmentsGet,
            Operation::ListThreads { .. } => OperationKind::ThreadsList,
            Operation::GetThread { .. } => OperationKind::ThreadsGet,
            Operation::TrashThread { .. } => OperationKind::ThreadsTrash,
            Operation::ListDrafts { .. } => OperationKind::DraftsList,
            Operation::GetDraft { .. } => OperationKind::DraftsGet,
            Operation::CreateDraft(_) => OperationKind::DraftsCreate,
            Operation::SendDraft { .. } => OperationKind::DraftsSend,
            Operation::DeleteDraft { .. } => OperationKind::DraftsDelete,
            Operation::ListLabels => OperationKind::LabelsList,
            Operation::GetLabel { .. } => OperationKind::LabelsGet,
            Operation::CreateLabel(_) => OperationKind::LabelsCreate,
            Operation::UpdateLabel { .. } => OperationKind::LabelsPatch,
            Operation::DeleteLabel { .. } => OperationKind::LabelsDelete,
            Operation::GetProfile => OperationKind::ProfileGet,
        }
    }

    /// Target message id, for per-message operations
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Operation::GetMessage { id, .. }
            | Operation::ModifyMessage { id, .. }
            | Operation::TrashMessage { id }
            | Operation::UntrashMessage { id }
            | Operation::DeleteMessage { id } => Some(id),
            Operation::GetAttachment { message_id, .. } => Some(message_id),
            _ => None,
        }
    }
}

/// Typed payload returned by the remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    MessagePage(MessagePage),
    Message(Message),
    Updated(MessageUpdate),
    Attachment(AttachmentData),
    ThreadPage(ThreadPage),
    Thread(Thread),
    DraftPage(DraftPage),
    Draft(Draft),
    Labels(Vec<Label>),
    Label(Label),
    LabelDetail(LabelDetail),
    Profile(Profile),
    Empty,
}

impl Response {
    fn variant_name(&self) -> &'static str {
        match self {
            Response::MessagePage(_) => "message page",
            Response::Message(_) => "message",
            Response::Updated(_) => "message update",
            Response::Attachment(_) => "attachment",
            Response::ThreadPage(_) => "thread page",
            Response::Thread(_) => "thread",
            Response::DraftPage(_) => "draft page",
            Response::Draft(_) => "draft",
            Response::Labels(_) => "label list",
            Response::Label(_) => "label",
            Response::LabelDetail(_) => "label detail",
            Response::Profile(_) => "profile",
            Response::Empty => "empty response",
        }
    }

    fn unexpected(&self, operation: &str) -> GmailError {
        GmailError::UnexpectedResponse {
            operation: operation.to_string(),
            got: self.variant_name().to_string(),
        }
    }

    pub fn into_message_page(self) -> Result<MessagePage> {
        match self {
            Response::MessagePage(page) => Ok(page),
            other => Err(other.unexpected("messages.list")),
        }
    }

    pub fn into_message(self) -> Result<Message> {
        match self {
            Response::Message(message) => Ok(message),
            other => Err(other.unexpected("messages.get")),
        }
    }

    pub fn into_update(self) -> Result<MessageUpdate> {
        match self {
            Response::Updated(update) => Ok(update),
            other => Err(other.unexpected("message mutation")),
        }
    }

    pub fn into_labels(self) -> Result<Vec<Label>> {
        match self {
            Response::Labels(labels) => Ok(labels),
            other => Err(other.unexpected("labels.list")),
        }
    }

    pub fn into_label(self) -> Result<Label> {
        match self {
            Response::Label(label) => Ok(label),
            other => Err(other.unexpected("label mutation")),
        }
    }

    pub fn into_label_detail(self) -> Result<LabelDetail> {
        match self {
            Response::LabelDetail(detail) => Ok(detail),
            other => Err(other.unexpected("labels.get")),
        }
    }

    pub fn into_attachment(self) -> Result<AttachmentData> {
        match self {
            Response::Attachment(attachment) => Ok(attachment),
            other => Err(other.unexpected("messages.attachments.get")),
        }
    }

    pub fn into_thread_page(self) -> Result<ThreadPage> {
        match self {
            Response::ThreadPage(page) => Ok(page),
            other => Err(other.unexpected("threads.list")),
        }
    }

    pub fn into_thread(self) -> Result<Thread> {
        match self {
            Response::Thread(thread) => Ok(thread),
            other => Err(other.unexpected("thread read or trash")),
        }
    }

    pub fn into_draft_page(self) -> Result<DraftPage> {
        match self {
            Response::DraftPage(page) => Ok(page),
            other => Err(other.unexpected("drafts.list")),
        }
    }

    pub fn into_draft(self) -> Result<Draft> {
        match self {
            Response::Draft(draft) => Ok(draft),
            other => Err(other.unexpected("draft read or create")),
        }
    }

    pub fn into_profile(self) -> Result<Profile> {
        match self {
            Response::Profile(profile) => Ok(profile),
            other => Err(other.unexpected("users.getProfile")),
        }
    }
}

/// Remote-service invocation interface
///
/// Implementations must classify failures into the [`GmailError`] taxonomy so
/// the retry layer can tell transient from fatal errors.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn invoke(&self, operation: &Operation) -> Result<Response>;
}

#[async_trait]
impl<T: RemoteService + ?Sized> RemoteService for Arc<T> {
    async fn invoke(&self, operation: &Operation) -> Result<Response> {
        self.as_ref().invoke(operation).await
    }
}
