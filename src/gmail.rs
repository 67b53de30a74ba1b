//! [`RemoteService`] backed by the Gmail REST API
//!
//! Translates [`Operation`]s into google-gmail1 calls and API payloads back
//! into crate models. Each request runs under a timeout; a timed-out request
//! surfaces as a [`GmailError::NetworkError`] so the retry layer treats it as
//! transient.

use async_trait::async_trait;
use email_address::EmailAddress;
use google_gmail1::api;
use mail_builder::headers::address::Address;
use mail_builder::MessageBuilder;
use std::future::Future;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::GmailHub;
use crate::error::{GmailError, Result};
use crate::models::{
    Attachment, AttachmentData, Draft, DraftPage, DraftRef, Label, LabelChange, LabelDetail,
    LabelUpdate, ListQuery, Message, MessageFormat, MessagePage, MessageRef, MessageUpdate,
    NewLabel, OutgoingMessage, Profile, Thread, ThreadPage, ThreadRef, UpdateStatus,
};
use crate::remote::{Operation, RemoteService, Response};

const SCOPE_MODIFY: &str = "https://www.googleapis.com/auth/gmail.modify";
const SCOPE_SEND: &str = "https://www.googleapis.com/auth/gmail.send";
const SCOPE_LABELS: &str = "https://www.googleapis.com/auth/gmail.labels";
const SCOPE_FULL: &str = "https://mail.google.com/";

/// Gmail API client for one authenticated account
pub struct GmailRemote {
    hub: GmailHub,
    timeout: Duration,
}

impl GmailRemote {
    pub fn new(hub: GmailHub, timeout: Duration) -> Self {
        Self { hub, timeout }
    }

    async fn timed<T, F>(&self, name: &str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, google_gmail1::Error>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(GmailError::from),
            Err(_) => {
                warn!("Gmail API {} call timed out after {:?}", name, self.timeout);
                Err(GmailError::NetworkError(format!(
                    "{} timed out after {:?}",
                    name, self.timeout
                )))
            }
        }
    }

    async fn list_messages(
        &self,
        query: &ListQuery,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<Response> {
        let mut call = self
            .hub
            .users()
            .messages_list("me")
            .max_results(page_size)
            .include_spam_trash(query.include_spam_trash);
        if !query.query.is_empty() {
            call = call.q(&query.query);
        }
        for label in &query.label_ids {
            call = call.add_label_ids(label);
        }
        if let Some(token) = page_token {
            call = call.page_token(token);
        }

        let (_, response) = self
            .timed("messages.list", call.add_scope(SCOPE_MODIFY).doit())
            .await?;

        let messages = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| match (m.id, m.thread_id) {
                (Some(id), thread_id) => Some(MessageRef {
                    id,
                    thread_id: thread_id.unwrap_or_default(),
                }),
                _ => None,
            })
            .collect();

        Ok(Response::MessagePage(MessagePage {
            messages,
            next_page_token: response.next_page_token,
        }))
    }

    async fn get_message(&self, id: &str, format: MessageFormat) -> Result<Response> {
        let call = self
            .hub
            .users()
            .messages_get("me", id)
            .format(format.as_str())
            .add_scope(SCOPE_MODIFY)
            .doit();
        let (_, message) = self.timed("messages.get", call).await?;
        Ok(Response::Message(parse_message(message)?))
    }

    async fn send_message(&self, outgoing: &OutgoingMessage) -> Result<Response> {
        let raw = compose_raw(outgoing)?;
        let metadata = api::Message {
            thread_id: outgoing.thread_id.clone(),
            ..Default::default()
        };

        let call = self
            .hub
            .users()
            .messages_send(metadata, "me")
            .add_scope(SCOPE_SEND)
            .upload(Cursor::new(raw), rfc822_mime()?);
        let (_, sent) = self.timed("messages.send", call).await?;
        Ok(Response::Updated(update_from(sent, UpdateStatus::Sent)?))
    }

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Response> {
        let call = self
            .hub
            .users()
            .messages_attachments_get("me", message_id, attachment_id)
            .add_scope(SCOPE_MODIFY)
            .doit();
        let (_, body) = self.timed("messages.attachments.get", call).await?;
        let data = body.data.unwrap_or_default();

        Ok(Response::Attachment(AttachmentData {
            attachment_id: body.attachment_id.unwrap_or_else(|| attachment_id.to_string()),
            size: body.size.unwrap_or(data.len() as i32),
            data,
        }))
    }

    async fn list_threads(
        &self,
        query: &ListQuery,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<Response> {
        let mut call = self
            .hub
            .users()
            .threads_list("me")
            .max_results(page_size)
            .include_spam_trash(query.include_spam_trash);
        if !query.query.is_empty() {
            call = call.q(&query.query);
        }
        for label in &query.label_ids {
            call = call.add_label_ids(label);
        }
        if let Some(token) = page_token {
            call = call.page_token(token);
        }

        let (_, response) = self
            .timed("threads.list", call.add_scope(SCOPE_MODIFY).doit())
            .await?;

        let threads = response
            .threads
            .unwrap_or_default()
            .into_iter()
            .filter_map(|thread| {
                thread.id.map(|id| ThreadRef {
                    id,
                    snippet: thread.snippet.unwrap_or_default(),
                    history_id: thread.history_id.map(|h| h.to_string()).unwrap_or_default(),
                })
            })
            .collect();

        Ok(Response::ThreadPage(ThreadPage {
            threads,
            next_page_token: response.next_page_token,
        }))
    }

    async fn get_thread(&self, id: &str, format: MessageFormat) -> Result<Response> {
        let call = self
            .hub
            .users()
            .threads_get("me", id)
            .format(format.as_str())
            .add_scope(SCOPE_MODIFY)
            .doit();
        let (_, thread) = self.timed("threads.get", call).await?;
        Ok(Response::Thread(parse_thread(thread)?))
    }

    async fn trash_thread(&self, id: &str) -> Result<Response> {
        let call = self
            .hub
            .users()
            .threads_trash("me", id)
            .add_scope(SCOPE_MODIFY)
            .doit();
        let (_, thread) = self.timed("threads.trash", call).await?;
        Ok(Response::Thread(parse_thread(thread)?))
    }

    async fn list_drafts(&self, page_size: u32, page_token: Option<&str>) -> Result<Response> {
        let mut call = self.hub.users().drafts_list("me").max_results(page_size);
        if let Some(token) = page_token {
            call = call.page_token(token);
        }
        let (_, response) = self
            .timed("drafts.list", call.add_scope(SCOPE_MODIFY).doit())
            .await?;

        let drafts = response
            .drafts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|draft| {
                let message = draft.message.unwrap_or_default();
                draft.id.map(|id| DraftRef {
                    id,
                    message: MessageRef {
                        id: message.id.unwrap_or_default(),
                        thread_id: message.thread_id.unwrap_or_default(),
                    },
                })
            })
            .collect();

        Ok(Response::DraftPage(DraftPage {
            drafts,
            next_page_token: response.next_page_token,
        }))
    }

    async fn get_draft(&self, id: &str) -> Result<Response> {
        let call = self
            .hub
            .users()
            .drafts_get("me", id)
            .format(MessageFormat::Full.as_str())
            .add_scope(SCOPE_MODIFY)
            .doit();
        let (_, draft) = self.timed("drafts.get", call).await?;
        Ok(Response::Draft(parse_draft(draft)?))
    }

    async fn create_draft(&self, outgoing: &OutgoingMessage) -> Result<Response> {
        let raw = compose_raw(outgoing)?;
        let draft = api::Draft {
            message: Some(api::Message {
                thread_id: outgoing.thread_id.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let call = self
            .hub
            .users()
            .drafts_create(draft, "me")
            .add_scope(SCOPE_MODIFY)
            .upload(Cursor::new(raw), rfc822_mime()?);
        let (_, created) = self.timed("drafts.create", call).await?;
        Ok(Response::Draft(parse_draft(created)?))
    }

    /// drafts.send only takes a media upload, so the stored raw draft is
    /// fetched first and sent back under the same draft id
    async fn send_draft(&self, id: &str) -> Result<Response> {
        let call = self
            .hub
            .users()
            .drafts_get("me", id)
            .format(MessageFormat::Raw.as_str())
            .add_scope(SCOPE_MODIFY)
            .doit();
        let (_, stored) = self.timed("drafts.get", call).await?;
        let stored_message = stored.message.unwrap_or_default();
        let raw = stored_message.raw.ok_or_else(|| {
            GmailError::InvalidMessageFormat(format!("draft {} has no raw message", id))
        })?;

        let draft = api::Draft {
            id: Some(id.to_string()),
            message: Some(api::Message {
                thread_id: stored_message.thread_id,
                ..Default::default()
            }),
        };
        let call = self
            .hub
            .users()
            .drafts_send(draft, "me")
            .add_scope(SCOPE_MODIFY)
            .upload(Cursor::new(raw), rfc822_mime()?);
        let (_, sent) = self.timed("drafts.send", call).await?;
        Ok(Response::Updated(update_from(sent, UpdateStatus::Sent)?))
    }

    async fn delete_draft(&self, id: &str) -> Result<Response> {
        let call = self
            .hub
            .users()
            .drafts_delete("me", id)
            .add_scope(SCOPE_MODIFY)
            .doit();
        self.timed("drafts.delete", call).await?;
        Ok(Response::Empty)
    }

    async fn modify_message(&self, id: &str, change: &LabelChange) -> Result<Response> {
        let request = api::ModifyMessageRequest {
            add_label_ids: (!change.add.is_empty()).then(|| change.add.clone()),
            remove_label_ids: (!change.remove.is_empty()).then(|| change.remove.clone()),
        };
        let call = self
            .hub
            .users()
            .messages_modify(request, "me", id)
            .add_scope(SCOPE_MODIFY)
            .doit();
        let (_, message) = self.timed("messages.modify", call).await?;
        Ok(Response::Updated(update_from(message, UpdateStatus::Modified)?))
    }

    async fn trash_message(&self, id: &str) -> Result<Response> {
        let call = self
            .hub
            .users()
            .messages_trash("me", id)
            .add_scope(SCOPE_MODIFY)
            .doit();
        let (_, message) = self.timed("messages.trash", call).await?;
        Ok(Response::Updated(update_from(message, UpdateStatus::Trashed)?))
    }

    async fn untrash_message(&self, id: &str) -> Result<Response> {
        let call = self
            .hub
            .users()
            .messages_untrash("me", id)
            .add_scope(SCOPE_MODIFY)
            .doit();
        let (_, message) = self.timed("messages.untrash", call).await?;
        Ok(Response::Updated(update_from(message, UpdateStatus::Untrashed)?))
    }

    async fn delete_message(&self, id: &str) -> Result<Response> {
        // Permanent deletion needs the full mail scope
        let call = self
            .hub
            .users()
            .messages_delete("me", id)
            .add_scope(SCOPE_FULL)
            .doit();
        self.timed("messages.delete", call).await?;
        Ok(Response::Updated(MessageUpdate {
            id: id.to_string(),
            thread_id: None,
            label_ids: Vec::new(),
            status: UpdateStatus::Deleted,
        }))
    }

    async fn list_labels(&self) -> Result<Response> {
        let call = self
            .hub
            .users()
            .labels_list("me")
            .add_scope(SCOPE_LABELS)
            .doit();
        let (_, response) = self.timed("labels.list", call).await?;

        let labels: Vec<Label> = response
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter_map(parse_label)
            .collect();
        debug!("Parsed {} labels", labels.len());
        Ok(Response::Labels(labels))
    }

    async fn create_label(&self, label: &NewLabel) -> Result<Response> {
        let request = api::Label {
            name: Some(label.name.clone()),
            message_list_visibility: Some(label.message_list_visibility.clone()),
            label_list_visibility: Some(label.label_list_visibility.clone()),
            ..Default::default()
        };
        let call = self
            .hub
            .users()
            .labels_create(request, "me")
            .add_scope(SCOPE_LABELS)
            .doit();
        let (_, created) = self.timed("labels.create", call).await?;

        parse_label(created)
            .map(Response::Label)
            .ok_or_else(|| GmailError::LabelError("Created label has no ID".to_string()))
    }

    async fn get_label(&self, id: &str) -> Result<Response> {
        let call = self
            .hub
            .users()
            .labels_get("me", id)
            .add_scope(SCOPE_LABELS)
            .doit();
        let (_, label) = self.timed("labels.get", call).await?;
        Ok(Response::LabelDetail(parse_label_detail(label)?))
    }

    async fn update_label(&self, id: &str, update: &LabelUpdate) -> Result<Response> {
        let request = api::Label {
            name: update.name.clone(),
            message_list_visibility: update.message_list_visibility.clone(),
            label_list_visibility: update.label_list_visibility.clone(),
            ..Default::default()
        };
        let call = self
            .hub
            .users()
            .labels_patch(request, "me", id)
            .add_scope(SCOPE_LABELS)
            .doit();
        let (_, updated) = self.timed("labels.patch", call).await?;

        parse_label(updated)
            .map(Response::Label)
            .ok_or_else(|| GmailError::LabelError(format!("Updated label {} has no name", id)))
    }

    async fn delete_label(&self, id: &str) -> Result<Response> {
        let call = self
            .hub
            .users()
            .labels_delete("me", id)
            .add_scope(SCOPE_LABELS)
            .doit();
        self.timed("labels.delete", call).await?;
        Ok(Response::Empty)
    }

    async fn get_profile(&self) -> Result<Response> {
        let call = self
            .hub
            .users()
            .get_profile("me")
            .add_scope(SCOPE_MODIFY)
            .doit();
        let (_, profile) = self.timed("users.getProfile", call).await?;

        Ok(Response::Profile(Profile {
            email: profile.email_address.unwrap_or_default(),
            messages_total: profile.messages_total.unwrap_or_default(),
            threads_total: profile.threads_total.unwrap_or_default(),
            history_id: profile
                .history_id
                .map(|h| h.to_string())
                .unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl RemoteService for GmailRemote {
    async fn invoke(&self, operation: &Operation) -> Result<Response> {
        match operation {
            Operation::ListMessages {
                query,
                page_size,
                page_token,
            } => {
                self.list_messages(query, *page_size, page_token.as_deref())
                    .await
            }
            Operation::GetMessage { id, format } => self.get_message(id, *format).await,
            Operation::SendMessage(message) => self.send_message(message).await,
            Operation::ModifyMessage { id, change } => self.modify_message(id, change).await,
            Operation::TrashMessage { id } => self.trash_message(id).await,
            Operation::UntrashMessage { id } => self.untrash_message(id).await,
            Operation::DeleteMessage { id } => self.delete_message(id).await,
            Operation::GetAttachment {
                message_id,
                attachment_id,
            } => self.get_attachment(message_id, attachment_id).await,
            Operation::ListThreads {
                query,
                page_size,
                page_token,
            } => {
                self.list_threads(query, *page_size, page_token.as_deref())
                    .await
            }
            Operation::GetThread { id, format } => self.get_thread(id, *format).await,
            Operation::TrashThread { id } => self.trash_thread(id).await,
            Operation::ListDrafts {
                page_size,
                page_token,
            } => self.list_drafts(*page_size, page_token.as_deref()).await,
            Operation::GetDraft { id } => self.get_draft(id).await,
            Operation::CreateDraft(message) => self.create_draft(message).await,
            Operation::SendDraft { id } => self.send_draft(id).await,
            Operation::DeleteDraft { id } => self.delete_draft(id).await,
            Operation::ListLabels => self.list_labels().await,
            Operation::GetLabel { id } => self.get_label(id).await,
            Operation::CreateLabel(label) => self.create_label(label).await,
            Operation::UpdateLabel { id, update } => self.update_label(id, update).await,
            Operation::DeleteLabel { id } => self.delete_label(id).await,
            Operation::GetProfile => self.get_profile().await,
        }
    }
}

fn parse_label(label: api::Label) -> Option<Label> {
    match (label.id, label.name) {
        (Some(id), Some(name)) => Some(Label {
            id,
            name,
            label_type: label.type_.unwrap_or_else(|| "user".to_string()),
            message_list_visibility: label.message_list_visibility,
            label_list_visibility: label.label_list_visibility,
        }),
        _ => None,
    }
}

fn parse_label_detail(label: api::Label) -> Result<LabelDetail> {
    let counters = (
        label.messages_total.unwrap_or_default(),
        label.messages_unread.unwrap_or_default(),
        label.threads_total.unwrap_or_default(),
        label.threads_unread.unwrap_or_default(),
    );
    let label = parse_label(label)
        .ok_or_else(|| GmailError::LabelError("Label has no ID or name".to_string()))?;
    Ok(LabelDetail {
        label,
        messages_total: counters.0,
        messages_unread: counters.1,
        threads_total: counters.2,
        threads_unread: counters.3,
    })
}

fn parse_thread(thread: api::Thread) -> Result<Thread> {
    let id = thread
        .id
        .ok_or_else(|| GmailError::InvalidMessageFormat("Missing thread ID".to_string()))?;
    let messages = thread
        .messages
        .unwrap_or_default()
        .into_iter()
        .map(parse_message)
        .collect::<Result<Vec<_>>>()?;
    Ok(Thread {
        id,
        snippet: thread.snippet.unwrap_or_default(),
        history_id: thread.history_id.map(|h| h.to_string()).unwrap_or_default(),
        messages,
    })
}

fn parse_draft(draft: api::Draft) -> Result<Draft> {
    let id = draft
        .id
        .ok_or_else(|| GmailError::InvalidMessageFormat("Missing draft ID".to_string()))?;
    let message = match draft.message {
        Some(message) => parse_message(message)?,
        None => Message::default(),
    };
    Ok(Draft { id, message })
}

fn update_from(message: api::Message, status: UpdateStatus) -> Result<MessageUpdate> {
    let id = message
        .id
        .ok_or_else(|| GmailError::InvalidMessageFormat("Missing message ID".to_string()))?;
    Ok(MessageUpdate {
        id,
        thread_id: message.thread_id,
        label_ids: message.label_ids.unwrap_or_default(),
        status,
    })
}

/// Convert an API message into a [`Message`]
///
/// Header fields are empty when the format did not include them.
pub(crate) fn parse_message(message: api::Message) -> Result<Message> {
    let id = message
        .id
        .ok_or_else(|| GmailError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let mut parsed = Message {
        id,
        thread_id: message.thread_id.unwrap_or_default(),
        label_ids: message.label_ids.unwrap_or_default(),
        snippet: message.snippet.unwrap_or_default(),
        size_estimate: message.size_estimate.unwrap_or_default(),
        internal_date: message.internal_date,
        ..Default::default()
    };

    if let Some(payload) = message.payload {
        for header in payload.headers.iter().flatten() {
            if let (Some(name), Some(value)) = (&header.name, &header.value) {
                let field = match name.to_lowercase().as_str() {
                    "from" => &mut parsed.from,
                    "to" => &mut parsed.to,
                    "cc" => &mut parsed.cc,
                    "subject" => &mut parsed.subject,
                    "date" => &mut parsed.date,
                    "message-id" => &mut parsed.message_id,
                    _ => continue,
                };
                *field = value.clone();
            }
        }
        collect_parts(&payload, &mut parsed);
    }

    if parsed.body.is_empty() && !parsed.body_html.is_empty() {
        parsed.body = parsed.body_html.clone();
    }
    Ok(parsed)
}

fn collect_parts(part: &api::MessagePart, message: &mut Message) {
    let mime_type = part.mime_type.as_deref().unwrap_or_default();
    let filename = part.filename.as_deref().unwrap_or_default();

    if !filename.is_empty() {
        let body = part.body.as_ref();
        message.attachments.push(Attachment {
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            size: body.and_then(|b| b.size).unwrap_or_default(),
            attachment_id: body.and_then(|b| b.attachment_id.clone()),
        });
    } else if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref()) {
        let text = String::from_utf8_lossy(data).into_owned();
        match mime_type {
            "text/plain" if message.body.is_empty() => message.body = text,
            "text/html" if message.body_html.is_empty() => message.body_html = text,
            _ => {}
        }
    }

    for child in part.parts.iter().flatten() {
        collect_parts(child, message);
    }
}

fn rfc822_mime() -> Result<mime::Mime> {
    "message/rfc822"
        .parse()
        .map_err(|e| GmailError::Unknown(format!("Invalid MIME type: {}", e)))
}

/// Split a recipient list on commas outside quotes and angle brackets
fn split_recipients(value: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut bracketed = false;
    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => bracketed = true,
            '>' if !quoted => bracketed = false,
            ',' if !quoted && !bracketed => {
                entries.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    entries.push(&value[start..]);
    entries
}

/// Parse `addr@host` and `Display Name <addr@host>` entries into addresses
fn parse_recipients<'x>(header: &str, value: &'x str) -> Result<Vec<Address<'x>>> {
    if value.contains(['\r', '\n']) {
        return Err(GmailError::BadRequest(format!(
            "{} must not contain line breaks",
            header
        )));
    }

    let mut recipients = Vec::new();
    for entry in split_recipients(value) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, email) = match (entry.rfind('<'), entry.strip_suffix('>')) {
            (Some(open), Some(inner)) => {
                let name = entry[..open].trim().trim_matches('"').trim();
                (Some(name).filter(|n| !n.is_empty()), inner[open + 1..].trim())
            }
            _ => (None, entry),
        };
        if !EmailAddress::is_valid(email) {
            return Err(GmailError::BadRequest(format!(
                "invalid {} address {:?}",
                header, email
            )));
        }
        recipients.push(Address::new_address(name, email));
    }
    Ok(recipients)
}

/// Build the RFC 5322 text of an outgoing message or draft
///
/// The sender is left out; Gmail fills it in from the authenticated account.
pub(crate) fn compose_raw(message: &OutgoingMessage) -> Result<Vec<u8>> {
    let to = parse_recipients("To", &message.to)?;
    if to.is_empty() {
        return Err(GmailError::BadRequest("Recipient is required".to_string()));
    }
    if message.subject.contains(['\r', '\n']) {
        return Err(GmailError::BadRequest(
            "Subject must not contain line breaks".to_string(),
        ));
    }

    let mut builder = MessageBuilder::new()
        .to(Address::new_list(to))
        .subject(message.subject.as_str());

    if let Some(cc) = &message.cc {
        let cc = parse_recipients("Cc", cc)?;
        if !cc.is_empty() {
            builder = builder.cc(Address::new_list(cc));
        }
    }
    if let Some(bcc) = &message.bcc {
        let bcc = parse_recipients("Bcc", bcc)?;
        if !bcc.is_empty() {
            builder = builder.bcc(Address::new_list(bcc));
        }
    }
    if let Some(reply_to) = &message.in_reply_to {
        let id = reply_to.trim().trim_start_matches('<').trim_end_matches('>');
        if id.is_empty() || id.contains(|c: char| c.is_whitespace()) {
            return Err(GmailError::BadRequest(format!(
                "invalid In-Reply-To message id {:?}",
                reply_to
            )));
        }
        builder = builder.in_reply_to(id).references(id);
    }

    builder = if message.html {
        builder.html_body(message.body.as_str())
    } else {
        builder.text_body(message.body.as_str())
    };
    for attachment in &message.attachments {
        builder = builder.attachment(
            attachment.content_type.as_str(),
            attachment.filename.as_str(),
            attachment.data.as_slice(),
        );
    }

    builder
        .write_to_vec()
        .map_err(|e| GmailError::InvalidMessageFormat(format!("could not encode message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutgoingAttachment;

    fn header(name: &str, value: &str) -> api::MessagePartHeader {
        api::MessagePartHeader {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    fn text_part(mime_type: &str, text: &str) -> api::MessagePart {
        api::MessagePart {
            mime_type: Some(mime_type.to_string()),
            body: Some(api::MessagePartBody {
                data: Some(text.as_bytes().to_vec()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_message_headers_and_bodies() {
        let message = api::Message {
            id: Some("m1".to_string()),
            thread_id: Some("t1".to_string()),
            label_ids: Some(vec!["INBOX".to_string(), "UNREAD".to_string()]),
            snippet: Some("Hello...".to_string()),
            internal_date: Some(1_704_124_800_000),
            payload: Some(api::MessagePart {
                mime_type: Some("multipart/mixed".to_string()),
                headers: Some(vec![
                    header("From", "Alice <alice@example.com>"),
                    header("Subject", "Quarterly report"),
                    header("To", "me@example.com"),
                    header("Message-ID", "<abc@example.com>"),
                ]),
                parts: Some(vec![
                    text_part("text/plain", "plain body"),
                    text_part("text/html", "<p>html body</p>"),
                    api::MessagePart {
                        mime_type: Some("application/pdf".to_string()),
                        filename: Some("report.pdf".to_string()),
                        body: Some(api::MessagePartBody {
                            attachment_id: Some("att-1".to_string()),
                            size: Some(2048),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let parsed = parse_message(message).unwrap();
        assert_eq!(parsed.from, "Alice <alice@example.com>");
        assert_eq!(parsed.subject, "Quarterly report");
        assert_eq!(parsed.message_id, "<abc@example.com>");
        assert_eq!(parsed.body, "plain body");
        assert_eq!(parsed.body_html, "<p>html body</p>");
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].attachment_id.as_deref(), Some("att-1"));
        assert_eq!(parsed.internal_date, Some(1_704_124_800_000));
    }

    #[test]
    fn test_parse_message_html_only_falls_back() {
        let message = api::Message {
            id: Some("m2".to_string()),
            payload: Some(text_part("text/html", "<b>hi</b>")),
            ..Default::default()
        };
        let parsed = parse_message(message).unwrap();
        assert_eq!(parsed.body, "<b>hi</b>");
    }

    #[test]
    fn test_parse_message_requires_id() {
        let err = parse_message(api::Message::default()).unwrap_err();
        assert!(matches!(err, GmailError::InvalidMessageFormat(_)));
    }

    fn outgoing(to: &str) -> OutgoingMessage {
        OutgoingMessage {
            to: to.to_string(),
            subject: "Quarterly report".to_string(),
            body: "Hello Bob".to_string(),
            ..Default::default()
        }
    }

    fn composed(message: &OutgoingMessage) -> String {
        String::from_utf8(compose_raw(message).unwrap()).unwrap()
    }

    #[test]
    fn test_split_recipients_respects_quotes_and_brackets() {
        assert_eq!(
            split_recipients(r#""Smith, Bob" <bob@example.com>, carol@example.com"#),
            vec![r#""Smith, Bob" <bob@example.com>"#, " carol@example.com"]
        );
        assert_eq!(split_recipients("a@example.com"), vec!["a@example.com"]);
    }

    #[test]
    fn test_compose_plain_message() {
        let message = OutgoingMessage {
            cc: Some("Carol <carol@example.com>".to_string()),
            in_reply_to: Some("<abc@mail.example.com>".to_string()),
            ..outgoing(r#""Smith, Bob" <bob@example.com>, dave@example.com"#)
        };
        let raw = composed(&message);

        assert!(raw.contains("bob@example.com"));
        assert!(raw.contains("dave@example.com"));
        assert!(raw.contains("Smith, Bob"));
        assert!(raw.contains("carol@example.com"));
        assert!(raw.contains("Subject: Quarterly report"));
        assert!(raw.contains("In-Reply-To: <abc@mail.example.com>"));
        assert!(raw.contains("References: <abc@mail.example.com>"));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("Hello Bob"));
    }

    #[test]
    fn test_compose_encodes_non_ascii() {
        let message = OutgoingMessage {
            subject: "Grüße aus Köln".to_string(),
            body: "Schöne Grüße".to_string(),
            html: true,
            ..outgoing("Jürgen <juergen@example.com>")
        };
        let raw = composed(&message);
        assert!(raw.is_ascii(), "raw message must be 7-bit: {}", raw);
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn test_compose_with_attachment() {
        let message = OutgoingMessage {
            attachments: vec![OutgoingAttachment {
                filename: "report.pdf".to_string(),
                content_type: "application/pdf".to_string(),
                data: b"%PDF-1.4 fake".to_vec(),
            }],
            ..outgoing("bob@example.com")
        };
        let raw = composed(&message);

        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("application/pdf"));
        assert!(raw.contains("report.pdf"));
        assert!(raw.contains("Hello Bob"));
    }

    #[test]
    fn test_compose_rejects_header_injection() {
        let injected = outgoing("bob@example.com\r\nBcc: eve@example.com");
        assert!(matches!(compose_raw(&injected), Err(GmailError::BadRequest(_))));

        let subject = OutgoingMessage {
            subject: "hi\r\nBcc: eve@example.com".to_string(),
            ..outgoing("bob@example.com")
        };
        assert!(matches!(compose_raw(&subject), Err(GmailError::BadRequest(_))));

        let reply = OutgoingMessage {
            in_reply_to: Some("<a@b> <c@d>".to_string()),
            ..outgoing("bob@example.com")
        };
        assert!(compose_raw(&reply).is_err());
    }

    #[test]
    fn test_compose_rejects_bad_recipients() {
        assert!(compose_raw(&OutgoingMessage::default()).is_err());
        assert!(compose_raw(&outgoing(" , ")).is_err());
        assert!(compose_raw(&outgoing("not-an-address")).is_err());
        assert!(compose_raw(&outgoing("Bob <bob@>")).is_err());

        let bad_cc = OutgoingMessage {
            cc: Some("carol".to_string()),
            ..outgoing("bob@example.com")
        };
        assert!(matches!(compose_raw(&bad_cc), Err(GmailError::BadRequest(_))));
    }

    #[test]
    fn test_parse_thread_and_draft() {
        let thread = parse_thread(api::Thread {
            id: Some("t1".to_string()),
            snippet: Some("Hi".to_string()),
            history_id: Some(77),
            messages: Some(vec![
                api::Message {
                    id: Some("m1".to_string()),
                    ..Default::default()
                },
                api::Message {
                    id: Some("m2".to_string()),
                    ..Default::default()
                },
            ]),
        })
        .unwrap();
        assert_eq!(thread.history_id, "77");
        assert_eq!(
            thread.messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );
        assert!(parse_thread(api::Thread::default()).is_err());

        let draft = parse_draft(api::Draft {
            id: Some("d1".to_string()),
            message: Some(api::Message {
                id: Some("m9".to_string()),
                ..Default::default()
            }),
        })
        .unwrap();
        assert_eq!(draft.id, "d1");
        assert_eq!(draft.message.id, "m9");
    }

    #[test]
    fn test_parse_label_detail() {
        let detail = parse_label_detail(api::Label {
            id: Some("Label_1".to_string()),
            name: Some("Receipts".to_string()),
            messages_total: Some(12),
            messages_unread: Some(3),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(detail.label.name, "Receipts");
        assert_eq!(detail.messages_unread, 3);
        assert_eq!(detail.threads_total, 0);
    }

    #[test]
    fn test_parse_label() {
        let label = parse_label(api::Label {
            id: Some("Label_1".to_string()),
            name: Some("Receipts".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(label.label_type, "user");
        assert!(parse_label(api::Label::default()).is_none());
    }
}
