use anyhow::Result;
use clap::Parser;
use gmail_resilience::cli::{self, Cli, Commands, ProgressReporter};
use gmail_resilience::config::Config;
use gmail_resilience::error::GmailError;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Routes log lines above the progress bars instead of through them
#[derive(Clone)]
struct ProgressAwareLog {
    multi: Arc<MultiProgress>,
}

/// One formatted event, printed when tracing drops the writer
struct PendingLine {
    multi: Arc<MultiProgress>,
    bytes: Vec<u8>,
}

impl Write for PendingLine {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for PendingLine {
    fn drop(&mut self) {
        let line = String::from_utf8_lossy(&self.bytes);
        let line = line.trim_end();
        if !line.is_empty() {
            let _ = self.multi.println(line);
        }
    }
}

impl<'a> MakeWriter<'a> for ProgressAwareLog {
    type Writer = PendingLine;

    fn make_writer(&'a self) -> Self::Writer {
        PendingLine {
            multi: Arc::clone(&self.multi),
            bytes: Vec::new(),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        display_error(&e);
        eprintln!("\nFor help, run: gmail-resilience --help");
        process::exit(1);
    }
}

fn init_tracing(cli: &Cli, multi: &Arc<MultiProgress>) {
    let default_filter = if cli.verbose {
        "gmail_resilience=debug,info"
    } else {
        "gmail_resilience=info,warn,error"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // JSON logs go straight to stderr so they stay machine-readable
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(ProgressAwareLog {
                multi: Arc::clone(multi),
            })
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

async fn run() -> Result<()> {
    // Several dependencies pull in different rustls crypto providers.
    // aws-lc-rs everywhere except Windows, where ring avoids the NASM/CMake toolchain.
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let multi_progress = Arc::new(MultiProgress::new());
    init_tracing(&cli, &multi_progress);

    if let Commands::InitConfig { output, force } = &cli.command {
        if output.exists() && !force {
            anyhow::bail!(
                "{} already exists; pass --force to overwrite it",
                output.display()
            );
        }
        Config::create_example(output).await?;
        println!("Wrote example configuration to {}", output.display());
        return Ok(());
    }

    let mut config = Config::load(&cli.config).await?;
    config.apply_env_overrides()?;

    tracing::debug!("Running {:?} for account {}", cli.command, cli.account);

    let reporter = ProgressReporter::with_multi(multi_progress);
    cli::run_command(&cli, &config, &reporter).await?;
    Ok(())
}

/// Display error with context
fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    if let Some(gmail_err) = error.downcast_ref::<GmailError>() {
        match gmail_err {
            GmailError::AuthError(_) => {
                eprintln!("\nHint: Make sure accounts/credentials.json is valid,");
                eprintln!("      or set GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET.");
                eprintln!("      Try running: gmail-resilience auth --force");
            }
            GmailError::RateLimitExceeded { .. } | GmailError::RateLimitError(_) => {
                eprintln!("\nHint: Gmail rate limits persisted through every retry.");
                eprintln!("      Wait a minute, or lower quota.budget in the config.");
            }
            GmailError::QuotaExceeded(_) => {
                eprintln!("\nHint: The request costs more units than quota.budget allows.");
                eprintln!("      Raise the budget or disable quota with GMAIL_ENABLE_QUOTA=false.");
            }
            GmailError::ServerError { .. } | GmailError::NetworkError(_) => {
                eprintln!("\nHint: This may be a temporary API error.");
                eprintln!("      Try running the command again.");
            }
            GmailError::ConfigError(_) => {
                eprintln!("\nHint: Check your configuration file for errors.");
                eprintln!("      Run: gmail-resilience init-config --force");
            }
            _ => {}
        }
    }
}
