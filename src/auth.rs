//! OAuth2 authentication and per-account token storage

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use google_gmail1::hyper_util::client::legacy::connect::HttpConnector;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use yup_oauth2::ApplicationSecret;

use crate::config::GmailConfig;
use crate::error::{GmailError, Result};

/// Scopes requested for every account
///
/// - gmail.modify: read, label and trash messages
/// - gmail.send: send messages
/// - gmail.labels: label management
/// - mail.google.com: permanent deletion
pub const REQUIRED_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.labels",
    "https://mail.google.com/",
];

pub type GmailHub = Gmail<hyper_rustls::HttpsConnector<HttpConnector>>;

/// File name reserved for the OAuth2 client secret inside the accounts directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Token cache path of `account` inside `accounts_dir`
///
/// Account names become file names, so they may not contain path
/// separators or start with a dot.
pub fn token_path(accounts_dir: &Path, account: &str) -> Result<PathBuf> {
    let valid = !account.is_empty()
        && !account.starts_with('.')
        && !account.contains(['/', '\\'])
        && format!("{}.json", account) != CREDENTIALS_FILE;
    if !valid {
        return Err(GmailError::ConfigError(format!(
            "Invalid account name: {:?}",
            account
        )));
    }
    Ok(accounts_dir.join(format!("{}.json", account)))
}

/// Accounts with a cached token, sorted by name
pub async fn list_accounts(accounts_dir: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(accounts_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut accounts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        if path.file_name().map_or(false, |name| name == CREDENTIALS_FILE) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            accounts.push(stem.to_string());
        }
    }

    accounts.sort();
    Ok(accounts)
}

/// Read the OAuth2 client secret, falling back to environment variables
/// when the credentials file does not exist
pub async fn load_application_secret(credentials_path: &Path) -> Result<ApplicationSecret> {
    if tokio::fs::try_exists(credentials_path).await.unwrap_or(false) {
        return yup_oauth2::read_application_secret(credentials_path)
            .await
            .map_err(|e| GmailError::AuthError(format!("Failed to read credentials: {}", e)));
    }
    debug!(
        path = %credentials_path.display(),
        "no credentials file, using {} and {}", CLIENT_ID_VAR, CLIENT_SECRET_VAR
    );
    secret_from_lookup(|name| env::var(name).ok())
}

const CLIENT_ID_VAR: &str = "GMAIL_CLIENT_ID";
const CLIENT_SECRET_VAR: &str = "GMAIL_CLIENT_SECRET";
const REDIRECT_URI_VAR: &str = "GMAIL_REDIRECT_URI";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:8080";

/// Build an installed-app secret from named variables; the redirect URI
/// is optional
fn secret_from_lookup<F>(lookup: F) -> Result<ApplicationSecret>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |name: &str| {
        lookup(name).ok_or_else(|| GmailError::ConfigError(format!("{} not set", name)))
    };

    Ok(ApplicationSecret {
        client_id: required(CLIENT_ID_VAR)?,
        client_secret: required(CLIENT_SECRET_VAR)?,
        auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
        token_uri: "https://oauth2.googleapis.com/token".to_string(),
        redirect_uris: vec![lookup(REDIRECT_URI_VAR).unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string())],
        ..Default::default()
    })
}

/// HTTP/1 only; google-gmail1 is more reliable over it
fn https_connector() -> Result<hyper_rustls::HttpsConnector<HttpConnector>> {
    Ok(hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| GmailError::AuthError(format!("Failed to load TLS roots: {}", e)))?
        .https_or_http()
        .enable_http1()
        .build())
}

/// Open a hub whose tokens live in `token_file`
///
/// The first call for an account runs the installed-app flow in a browser.
/// The token is requested eagerly so a consent problem surfaces here rather
/// than on the first API call.
pub async fn connect_hub(secret: ApplicationSecret, token_file: &Path) -> Result<GmailHub> {
    let authenticator = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_file)
    .build()
    .await
    .map_err(|e| GmailError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    authenticator
        .token(REQUIRED_SCOPES)
        .await
        .map_err(|e| GmailError::AuthError(format!("Failed to obtain token: {}", e)))?;

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(https_connector()?);
    Ok(Gmail::new(client, authenticator))
}

/// Authenticate `account`, creating its token file on first use
pub async fn authenticate_account(config: &GmailConfig, account: &str) -> Result<GmailHub> {
    let token_file = token_path(&config.accounts_dir, account)?;
    tokio::fs::create_dir_all(&config.accounts_dir).await?;

    let secret = load_application_secret(&config.credentials).await?;
    let hub = connect_hub(secret, &token_file).await?;

    if tokio::fs::try_exists(&token_file).await.unwrap_or(false) {
        restrict_to_owner(&token_file).await?;
    }
    info!(account, "authenticated");
    Ok(hub)
}

/// Scopes requested from application default credentials; gcloud has to
/// have been logged in with them
pub const ADC_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.labels",
];

const ADC_PATH_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const ADC_FILE: &str = "application_default_credentials.json";

/// Location of the application default credentials file, if one can be named
///
/// `GOOGLE_APPLICATION_CREDENTIALS` wins; otherwise gcloud's well-known path.
pub fn adc_credentials_path() -> Option<PathBuf> {
    adc_path_from_lookup(|name| env::var(name).ok())
}

fn adc_path_from_lookup<F>(lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup(ADC_PATH_VAR).filter(|path| !path.is_empty()) {
        return Some(PathBuf::from(path));
    }
    if cfg!(windows) {
        lookup("APPDATA").map(|dir| PathBuf::from(dir).join("gcloud").join(ADC_FILE))
    } else {
        lookup("HOME").map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("gcloud")
                .join(ADC_FILE)
        })
    }
}

/// Open a hub with the authorized-user credentials written by
/// `gcloud auth application-default login`
///
/// No per-account token file is involved; the refresh token in `path` is
/// used directly.
pub async fn authenticate_adc(path: &Path) -> Result<GmailHub> {
    let secret = yup_oauth2::read_authorized_user_secret(path)
        .await
        .map_err(|e| {
            GmailError::AuthError(format!(
                "Failed to read application default credentials {:?}: {}",
                path, e
            ))
        })?;
    let authenticator = yup_oauth2::AuthorizedUserAuthenticator::builder(secret)
        .build()
        .await
        .map_err(|e| GmailError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    authenticator
        .token(ADC_SCOPES)
        .await
        .map_err(|e| GmailError::AuthError(format!("Failed to obtain token: {}", e)))?;

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(https_connector()?);
    info!(path = %path.display(), "authenticated with application default credentials");
    Ok(Gmail::new(client, authenticator))
}

/// Token files hold refresh tokens; keep them mode 0600
#[cfg(unix)]
pub async fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
pub async fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}
