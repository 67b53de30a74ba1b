//! Command-line interface

use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::auth;
use crate::batch::{BatchResult, ItemProgress, ItemState, ProgressCallback};
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::{GmailError, Result};
use crate::gmail::GmailRemote;
use crate::models::{
    LabelChange, LabelUpdate, ListQuery, MessageFormat, NewLabel, OutgoingAttachment,
    OutgoingMessage,
};
use crate::service::MailService;

#[derive(Parser, Debug)]
#[command(name = "gmail-resilience")]
#[command(version)]
#[command(about = "Quota-aware, cached and retried Gmail operations", long_about = None)]
pub struct Cli {
    /// Account name; its token lives at <accounts_dir>/<account>.json
    #[arg(short, long, default_value = "default", global = true)]
    pub account: String,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Authenticate with gcloud application default credentials instead of
    /// the account's token file
    #[arg(long, global = true)]
    pub adc: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate the account with the Gmail API
    Auth {
        /// Discard the cached token and run the consent flow again
        #[arg(long)]
        force: bool,
    },

    /// List accounts that have a cached token
    Accounts,

    /// Show the account's mailbox profile
    Profile,

    /// List messages matching a search query
    List {
        /// Gmail search query (e.g. "from:alice is:unread")
        #[arg(short, long, default_value = "")]
        query: String,

        /// Restrict to messages carrying this label id (repeatable)
        #[arg(short, long = "label")]
        labels: Vec<String>,

        /// Maximum number of messages
        #[arg(short, long, default_value_t = 20)]
        max: usize,

        /// Include spam and trash
        #[arg(long)]
        include_spam_trash: bool,

        /// Skip the response cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Read one message
    Read {
        id: String,

        #[arg(short, long, value_enum, default_value_t = FormatArg::Full)]
        format: FormatArg,

        #[arg(long)]
        no_cache: bool,
    },

    /// List labels
    Labels {
        #[arg(long)]
        no_cache: bool,
    },

    /// Create a user label
    CreateLabel { name: String },

    /// Delete a user label by id
    DeleteLabel { id: String },

    /// Show a label with its message and thread counters
    Label { id: String },

    /// Rename a user label or change its visibility
    UpdateLabel {
        id: String,

        #[arg(long)]
        name: Option<String>,

        /// show, hide
        #[arg(long)]
        message_list_visibility: Option<String>,

        /// labelShow, labelShowIfUnread, labelHide
        #[arg(long)]
        label_list_visibility: Option<String>,
    },

    /// Send a message
    Send(ComposeArgs),

    /// Save a message as a draft
    CreateDraft(ComposeArgs),

    /// List drafts
    Drafts {
        #[arg(short, long, default_value_t = 20)]
        max: usize,
    },

    /// Show one draft
    Draft { id: String },

    /// Send an existing draft
    SendDraft { id: String },

    /// Delete a draft
    DeleteDraft { id: String },

    /// List conversation threads matching a search query
    Threads {
        #[arg(short, long, default_value = "")]
        query: String,

        #[arg(short, long = "label")]
        labels: Vec<String>,

        #[arg(short, long, default_value_t = 20)]
        max: usize,
    },

    /// Read every message of a thread
    Thread {
        id: String,

        #[arg(short, long, value_enum, default_value_t = FormatArg::Metadata)]
        format: FormatArg,
    },

    /// Move a whole thread to the trash
    TrashThread { id: String },

    /// Download an attachment of a message
    Attachment {
        message_id: String,

        attachment_id: String,

        /// File to write; defaults to the attachment id
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Add or remove labels on a message
    Modify {
        id: String,

        #[arg(long)]
        add: Vec<String>,

        #[arg(long)]
        remove: Vec<String>,
    },

    /// Move a message to the trash
    Trash {
        id: String,

        /// Restore the message from the trash instead
        #[arg(long)]
        undo: bool,
    },

    /// Permanently delete a message
    Delete {
        id: String,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Move several messages to the trash
    BatchTrash {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Permanently delete several messages
    BatchDelete {
        #[arg(required = true)]
        ids: Vec<String>,

        #[arg(short, long)]
        yes: bool,
    },

    /// Mark every message matching a query as read
    MarkAllRead {
        /// Defaults to "is:unread"
        #[arg(short, long)]
        query: Option<String>,

        /// Defaults to batch.max_messages
        #[arg(short, long)]
        max: Option<usize>,
    },

    /// Archive inbox messages matching a query
    ArchiveAll {
        #[arg(short, long)]
        query: Option<String>,

        #[arg(short, long)]
        max: Option<usize>,
    },

    /// Show cache entries for the account; hit and miss counters only
    /// cover lookups made by this process
    CacheStats,

    /// Remove every cached response for the account
    ClearCache,

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Fields of a message to send or save as a draft
#[derive(Args, Debug, Clone)]
pub struct ComposeArgs {
    /// Comma-separated recipients, `addr` or `Name <addr>`
    #[arg(long)]
    pub to: String,

    #[arg(short, long)]
    pub subject: String,

    /// Message body
    #[arg(short, long)]
    pub body: String,

    #[arg(long)]
    pub cc: Option<String>,

    #[arg(long)]
    pub bcc: Option<String>,

    /// Send the body as text/html
    #[arg(long)]
    pub html: bool,

    /// Thread to reply in
    #[arg(long)]
    pub thread_id: Option<String>,

    /// Message-ID header of the message being answered
    #[arg(long)]
    pub in_reply_to: Option<String>,

    /// File to attach (repeatable)
    #[arg(long = "attach")]
    pub attachments: Vec<PathBuf>,
}

impl ComposeArgs {
    /// Read the attached files and assemble the message
    pub async fn into_message(self) -> Result<OutgoingMessage> {
        let mut attachments = Vec::with_capacity(self.attachments.len());
        for path in &self.attachments {
            attachments.push(OutgoingAttachment::from_path(path).await?);
        }
        Ok(OutgoingMessage {
            to: self.to,
            subject: self.subject,
            body: self.body,
            cc: self.cc,
            bcc: self.bcc,
            html: self.html,
            in_reply_to: self.in_reply_to,
            thread_id: self.thread_id,
            attachments,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Full,
    Metadata,
    Minimal,
    Raw,
}

impl From<FormatArg> for MessageFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Full => MessageFormat::Full,
            FormatArg::Metadata => MessageFormat::Metadata,
            FormatArg::Minimal => MessageFormat::Minimal,
            FormatArg::Raw => MessageFormat::Raw,
        }
    }
}

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: Arc<MultiProgress>,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi(Arc::new(MultiProgress::new()))
    }

    /// Share `multi` with the log writer so log lines print above the bars
    pub fn with_multi(multi: Arc<MultiProgress>) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }

    /// A bar advanced by every finished batch item
    ///
    /// The length follows the batch size, which for query-driven batches is
    /// only known once the ids are resolved.
    pub fn batch_progress(&self, msg: &str) -> (ProgressBar, ProgressCallback) {
        let pb = self.add_progress_bar(0, msg);
        let bar = pb.clone();
        let callback: ProgressCallback = Arc::new(move |item: &ItemProgress<'_>| {
            bar.set_length(item.total as u64);
            bar.set_position(item.completed as u64);
            if item.state == ItemState::Failed {
                bar.println(format!("  ✗ {}", item.id));
            }
        });
        (pb, callback)
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_batch_summary<T>(action: &str, result: &BatchResult<T>) {
    println!(
        "{}: {} of {} succeeded, {} failed (batch {})",
        action, result.succeeded, result.total, result.failed, result.batch_id
    );
    for failure in &result.failures {
        println!("  {}: {}", failure.id, failure.error);
    }
}

/// Prompt user for confirmation
fn confirm_action(prompt: &str) -> Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Authenticate `account` and wire the Gmail client into a service
///
/// With `adc`, gcloud's application default credentials are used and the
/// account name only selects quota and cache state.
pub async fn build_service(config: &Config, account: &str, adc: bool) -> Result<MailService> {
    let hub = if adc {
        let path = auth::adc_credentials_path().ok_or_else(|| {
            GmailError::AuthError(
                "no application default credentials: set GOOGLE_APPLICATION_CREDENTIALS or run \
                 `gcloud auth application-default login`"
                    .to_string(),
            )
        })?;
        auth::authenticate_adc(&path).await?
    } else {
        auth::authenticate_account(&config.gmail, account).await?
    };
    let remote = GmailRemote::new(hub, Duration::from_secs(config.gmail.timeout_secs));
    Ok(MailService::from_config(account, Arc::new(remote), config))
}

/// Run every command except `init-config`, which needs no configuration
pub async fn run_command(cli: &Cli, config: &Config, reporter: &ProgressReporter) -> Result<()> {
    let account = cli.account.as_str();

    match &cli.command {
        Commands::InitConfig { .. } => Err(GmailError::ConfigError(
            "init-config is handled before configuration is loaded".to_string(),
        )),

        Commands::Accounts => {
            let accounts = auth::list_accounts(&config.gmail.accounts_dir).await?;
            if cli.json {
                return print_json(&accounts);
            }
            if accounts.is_empty() {
                println!("No authenticated accounts in {:?}", config.gmail.accounts_dir);
            }
            for name in accounts {
                println!("{}", name);
            }
            Ok(())
        }

        Commands::Auth { force } => {
            let token = auth::token_path(&config.gmail.accounts_dir, account)?;
            if *force && tokio::fs::try_exists(&token).await.unwrap_or(false) {
                tokio::fs::remove_file(&token).await?;
                info!("Removed cached token {:?}", token);
            }
            let service = build_service(config, account, cli.adc).await?;
            let profile = service.get_profile().await?;
            if cli.json {
                return print_json(&profile);
            }
            println!("Authenticated {} as {}", account, profile.email);
            Ok(())
        }

        Commands::CacheStats => {
            let stats = ResponseCache::from_config(&config.cache)
                .get_stats(account)
                .await;
            if cli.json {
                return print_json(&stats);
            }
            println!("Cache for {} ({}):", stats.account, stats.backend);
            println!("  lists:    {}", stats.list_entries);
            println!("  messages: {}", stats.message_entries);
            println!("  metadata: {}", stats.metadata_entries);
            println!("  labels:   {}", stats.label_entries);
            println!("  hits/misses this process: {}/{}", stats.hits, stats.misses);
            Ok(())
        }

        Commands::ClearCache => {
            let removed = ResponseCache::from_config(&config.cache)
                .invalidate_account(account)
                .await;
            if cli.json {
                return print_json(&serde_json::json!({ "account": account, "removed": removed }));
            }
            println!("Removed {} cached entries for {}", removed, account);
            Ok(())
        }

        command => {
            let service = build_service(config, account, cli.adc).await?;
            run_service_command(cli, command, service, reporter).await
        }
    }
}

async fn run_service_command(
    cli: &Cli,
    command: &Commands,
    service: MailService,
    reporter: &ProgressReporter,
) -> Result<()> {
    match command {
        Commands::Profile => {
            let profile = service.get_profile().await?;
            if cli.json {
                return print_json(&profile);
            }
            println!("{}", profile.email);
            println!("  messages: {}", profile.messages_total);
            println!("  threads:  {}", profile.threads_total);
            Ok(())
        }

        Commands::List {
            query,
            labels,
            max,
            include_spam_trash,
            no_cache,
        } => {
            let mut list = ListQuery::new(query.as_str())
                .with_labels(labels.clone())
                .with_max_results(*max);
            list.include_spam_trash = *include_spam_trash;

            let spinner = reporter.add_spinner("Listing messages...");
            let refs = service.list_messages(&list, !no_cache).await?;
            let ids: Vec<String> = refs.iter().map(|r| r.id.clone()).collect();
            let details = service
                .batch_get_messages(&ids, MessageFormat::Metadata)
                .await;
            reporter.finish_spinner(&spinner, &format!("{} messages", refs.len()));

            if cli.json {
                return print_json(&details.successes);
            }
            for message in &details.successes {
                println!(
                    "{:<18} {:<30} {}",
                    message.id,
                    truncate_string(&message.from, 30),
                    truncate_string(&message.subject, 60)
                );
            }
            for failure in &details.failures {
                println!("{:<18} <unavailable: {}>", failure.id, failure.error);
            }
            Ok(())
        }

        Commands::Read {
            id,
            format,
            no_cache,
        } => {
            let message = service.get_message(id, (*format).into(), !no_cache).await?;
            if cli.json {
                return print_json(&message);
            }
            println!("From:    {}", message.from);
            println!("To:      {}", message.to);
            if !message.cc.is_empty() {
                println!("Cc:      {}", message.cc);
            }
            println!("Date:    {}", message.date);
            println!("Subject: {}", message.subject);
            println!("Labels:  {}", message.label_ids.join(", "));
            println!();
            if message.body.is_empty() {
                println!("{}", message.snippet);
            } else {
                println!("{}", message.body);
            }
            for attachment in &message.attachments {
                println!(
                    "[attachment] {} ({}, {} bytes)",
                    attachment.filename, attachment.mime_type, attachment.size
                );
            }
            Ok(())
        }

        Commands::Labels { no_cache } => {
            let labels = service.list_labels(!no_cache).await?;
            if cli.json {
                return print_json(&labels);
            }
            for label in labels {
                println!("{:<24} {:<8} {}", label.id, label.label_type, label.name);
            }
            Ok(())
        }

        Commands::CreateLabel { name } => {
            let label = service.create_label(&NewLabel::new(name.as_str())).await?;
            if cli.json {
                return print_json(&label);
            }
            println!("Created label {} ({})", label.name, label.id);
            Ok(())
        }

        Commands::DeleteLabel { id } => {
            service.delete_label(id).await?;
            println!("Deleted label {}", id);
            Ok(())
        }

        Commands::Label { id } => {
            let detail = service.get_label(id).await?;
            if cli.json {
                return print_json(&detail);
            }
            println!("{} ({})", detail.label.name, detail.label.id);
            println!(
                "  messages: {} ({} unread)",
                detail.messages_total, detail.messages_unread
            );
            println!(
                "  threads:  {} ({} unread)",
                detail.threads_total, detail.threads_unread
            );
            Ok(())
        }

        Commands::UpdateLabel {
            id,
            name,
            message_list_visibility,
            label_list_visibility,
        } => {
            let update = LabelUpdate {
                name: name.clone(),
                message_list_visibility: message_list_visibility.clone(),
                label_list_visibility: label_list_visibility.clone(),
            };
            let label = service.update_label(id, &update).await?;
            if cli.json {
                return print_json(&label);
            }
            println!("Updated label {} ({})", label.name, label.id);
            Ok(())
        }

        Commands::Send(args) => {
            let message = args.clone().into_message().await?;
            let update = service.send_message(&message).await?;
            if cli.json {
                return print_json(&update);
            }
            println!("Sent message {}", update.id);
            Ok(())
        }

        Commands::CreateDraft(args) => {
            let message = args.clone().into_message().await?;
            let draft = service.create_draft(&message).await?;
            if cli.json {
                return print_json(&draft);
            }
            println!("Saved draft {}", draft.id);
            Ok(())
        }

        Commands::Drafts { max } => {
            let drafts = service.list_drafts(*max).await?;
            if cli.json {
                return print_json(&drafts);
            }
            for draft in &drafts {
                println!("{:<24} message {}", draft.id, draft.message.id);
            }
            Ok(())
        }

        Commands::Draft { id } => {
            let draft = service.get_draft(id).await?;
            if cli.json {
                return print_json(&draft);
            }
            println!("Draft {}", draft.id);
            println!("To:      {}", draft.message.to);
            println!("Subject: {}", draft.message.subject);
            println!();
            println!("{}", draft.message.body);
            Ok(())
        }

        Commands::SendDraft { id } => {
            let update = service.send_draft(id).await?;
            if cli.json {
                return print_json(&update);
            }
            println!("Sent draft {} as message {}", id, update.id);
            Ok(())
        }

        Commands::DeleteDraft { id } => {
            service.delete_draft(id).await?;
            println!("Deleted draft {}", id);
            Ok(())
        }

        Commands::Threads {
            query,
            labels,
            max,
        } => {
            let list = ListQuery::new(query.as_str())
                .with_labels(labels.clone())
                .with_max_results(*max);
            let threads = service.list_threads(&list).await?;
            if cli.json {
                return print_json(&threads);
            }
            for thread in &threads {
                println!("{:<18} {}", thread.id, truncate_string(&thread.snippet, 80));
            }
            Ok(())
        }

        Commands::Thread { id, format } => {
            let thread = service.get_thread(id, (*format).into()).await?;
            if cli.json {
                return print_json(&thread);
            }
            println!("Thread {} ({} messages)", thread.id, thread.messages.len());
            for message in &thread.messages {
                println!(
                    "{:<18} {:<30} {}",
                    message.id,
                    truncate_string(&message.from, 30),
                    truncate_string(&message.subject, 60)
                );
            }
            Ok(())
        }

        Commands::TrashThread { id } => {
            let thread = service.trash_thread(id).await?;
            if cli.json {
                return print_json(&thread);
            }
            println!("Trashed thread {}", thread.id);
            Ok(())
        }

        Commands::Attachment {
            message_id,
            attachment_id,
            output,
        } => {
            let attachment = service.get_attachment(message_id, attachment_id).await?;
            let path = output
                .clone()
                .unwrap_or_else(|| PathBuf::from(&attachment.attachment_id));
            tokio::fs::write(&path, &attachment.data).await?;
            info!(path = %path.display(), bytes = attachment.data.len(), "Saved attachment");
            println!("Wrote {} bytes to {}", attachment.data.len(), path.display());
            Ok(())
        }

        Commands::Modify { id, add, remove } => {
            let change = LabelChange {
                add: add.clone(),
                remove: remove.clone(),
            };
            if change.is_empty() {
                return Err(GmailError::LabelError(
                    "nothing to change; pass --add or --remove".to_string(),
                ));
            }
            let update = service.modify_message(id, &change).await?;
            if cli.json {
                return print_json(&update);
            }
            println!("{} now has labels: {}", update.id, update.label_ids.join(", "));
            Ok(())
        }

        Commands::Trash { id, undo } => {
            let update = if *undo {
                service.untrash_message(id).await?
            } else {
                service.trash_message(id).await?
            };
            if cli.json {
                return print_json(&update);
            }
            println!("{} {}", update.status, update.id);
            Ok(())
        }

        Commands::Delete { id, yes } => {
            if !yes && !confirm_action(&format!("Permanently delete message {}?", id))? {
                println!("Aborted");
                return Ok(());
            }
            let update = service.delete_message(id).await?;
            if cli.json {
                return print_json(&update);
            }
            println!("{} {}", update.status, update.id);
            Ok(())
        }

        Commands::BatchTrash { ids } => {
            let (pb, progress) = reporter.batch_progress("Trashing messages...");
            let result = service.with_progress(progress).batch_trash_messages(ids).await;
            pb.finish_and_clear();
            report_batch(cli, "Trashed", &result)
        }

        Commands::BatchDelete { ids, yes } => {
            if !yes
                && !confirm_action(&format!("Permanently delete {} messages?", ids.len()))?
            {
                println!("Aborted");
                return Ok(());
            }
            let (pb, progress) = reporter.batch_progress("Deleting messages...");
            let result = service.with_progress(progress).batch_delete_messages(ids).await;
            pb.finish_and_clear();
            report_batch(cli, "Deleted", &result)
        }

        Commands::MarkAllRead { query, max } => {
            let (pb, progress) = reporter.batch_progress("Marking messages as read...");
            let result = service
                .with_progress(progress)
                .mark_all_as_read(query.as_deref(), *max)
                .await;
            pb.finish_and_clear();
            report_batch(cli, "Marked as read", &result?)
        }

        Commands::ArchiveAll { query, max } => {
            let (pb, progress) = reporter.batch_progress("Archiving messages...");
            let result = service
                .with_progress(progress)
                .archive_all(query.as_deref(), *max)
                .await;
            pb.finish_and_clear();
            report_batch(cli, "Archived", &result?)
        }

        Commands::InitConfig { .. }
        | Commands::Accounts
        | Commands::Auth { .. }
        | Commands::CacheStats
        | Commands::ClearCache => Err(GmailError::Unknown(format!(
            "{:?} does not run against the mail service",
            command
        ))),
    }
}

fn report_batch<T: Serialize>(cli: &Cli, action: &str, result: &BatchResult<T>) -> Result<()> {
    if cli.json {
        print_json(result)?;
    } else {
        print_batch_summary(action, result);
    }
    if result.is_success() {
        Ok(())
    } else {
        Err(GmailError::ApiError(format!(
            "{} of {} items failed",
            result.failed, result.total
        )))
    }
}
