//! `contentflow-console` -- terminal front end for the content generation backend.
//!
//! Submits brand data, brief and draft jobs, follows their status and
//! logs, and reviews AI edits.
//!
//! # Environment variables
//!
//! | Variable                       | Default                     | Description                  |
//! |--------------------------------|-----------------------------|------------------------------|
//! | `CONTENTFLOW_API_URL`          | `http://localhost:8000/api` | Backend base URL             |
//! | `CONTENTFLOW_POLL_INTERVAL_MS` | `2000`                      | Status poll interval         |
//! | `RUST_LOG`                     | `contentflow_console=info`  | Log filter (stderr)          |
//!
//! The remaining client settings are documented on `ClientConfig::from_env`.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use contentflow_client::ClientConfig;
use contentflow_core::files::FileKind;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "contentflow", version, about = "Drive the contentflow backend from a terminal")]
struct Cli {
    /// Backend base URL, including the `/api` prefix.
    #[arg(long, env = "CONTENTFLOW_API_URL", global = true)]
    api_url: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scrape brand data for one brand.
    BrandData {
        name: String,
        #[arg(required = true)]
        urls: Vec<String>,
        /// Stream the job's logs until it finishes.
        #[arg(long)]
        follow: bool,
    },
    /// Generate one brief.
    Brief {
        title: String,
        #[arg(long)]
        keyword: String,
        #[arg(long, default_value = "")]
        secondary: String,
        /// Brand data file the brief is based on.
        #[arg(long)]
        brand_data: String,
        #[arg(long)]
        follow: bool,
    },
    /// Generate one draft from a brief.
    Draft {
        brief: String,
        #[arg(long)]
        brand_data: String,
        #[arg(long)]
        follow: bool,
    },
    /// Submit briefs or drafts in bulk from a JSON array.
    Batch {
        #[arg(value_enum)]
        kind: BatchKind,
        file: PathBuf,
        /// Skip incomplete entries without asking.
        #[arg(long)]
        yes: bool,
    },
    /// Ask for an AI edit of a brief or draft.
    Edit {
        kind: FileKind,
        filename: String,
        instructions: String,
        /// Wait for the proposed diff and print its id.
        #[arg(long)]
        wait: bool,
    },
    /// Show a job's status.
    Status {
        job_id: String,
        /// Keep polling until the job finishes.
        #[arg(long)]
        watch: bool,
    },
    /// Stream a job's logs.
    Logs {
        job_id: String,
        /// Also save the full log to this file.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Review a proposed edit.
    Diff {
        #[command(subcommand)]
        action: DiffAction,
    },
    /// List backend files, newest first.
    Files { kind: FileKind },
    /// Print a file.
    Show { kind: FileKind, filename: String },
    /// Overwrite a backend file with local content.
    Save {
        kind: FileKind,
        filename: String,
        source: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BatchKind {
    Briefs,
    Drafts,
}

#[derive(Debug, Subcommand)]
enum DiffAction {
    /// Print both sides of a diff.
    Show { diff_id: String },
    /// Apply the proposal, or the content of `--content` instead.
    Approve {
        diff_id: String,
        #[arg(long)]
        content: Option<PathBuf>,
    },
    /// Discard the proposal.
    Reject { diff_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "contentflow_console=info,contentflow_client=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let mut config = ClientConfig::from_env()?;
    if let Some(url) = cli.api_url {
        config.api_url = url.trim_end_matches('/').to_string();
    }
    tracing::debug!(api_url = %config.api_url, "Configuration loaded");

    let app = commands::App::new(config)?;

    match cli.command {
        Command::BrandData { name, urls, follow } => app.brand_data(name, urls, follow).await,
        Command::Brief {
            title,
            keyword,
            secondary,
            brand_data,
            follow,
        } => app.brief(title, keyword, secondary, brand_data, follow).await,
        Command::Draft {
            brief,
            brand_data,
            follow,
        } => app.draft(brief, brand_data, follow).await,
        Command::Batch { kind, file, yes } => match kind {
            BatchKind::Briefs => app.batch_briefs(&file, yes).await,
            BatchKind::Drafts => app.batch_drafts(&file, yes).await,
        },
        Command::Edit {
            kind,
            filename,
            instructions,
            wait,
        } => app.edit(kind, filename, instructions, wait).await,
        Command::Status { job_id, watch } => app.status(&job_id, watch).await,
        Command::Logs { job_id, output } => app.logs(&job_id, output.as_deref()).await,
        Command::Diff { action } => match action {
            DiffAction::Show { diff_id } => app.diff_show(&diff_id).await,
            DiffAction::Approve { diff_id, content } => {
                app.diff_approve(&diff_id, content.as_deref()).await
            }
            DiffAction::Reject { diff_id } => app.diff_reject(&diff_id).await,
        },
        Command::Files { kind } => app.files(kind).await,
        Command::Show { kind, filename } => app.show(kind, &filename).await,
        Command::Save {
            kind,
            filename,
            source,
        } => app.save(kind, &filename, &source).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_batch_and_file_kinds() {
        let cli = Cli::try_parse_from(["contentflow", "batch", "drafts", "drafts.json", "--yes"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Command::Batch {
                kind: BatchKind::Drafts,
                yes: true,
                ..
            }
        ));

        let cli = Cli::try_parse_from(["contentflow", "files", "brand-data"]).unwrap();
        assert!(matches!(cli.command, Command::Files { kind: FileKind::BrandData }));

        assert!(Cli::try_parse_from(["contentflow", "files", "videos"]).is_err());
    }

    #[test]
    fn brand_data_requires_a_url() {
        assert!(Cli::try_parse_from(["contentflow", "brand-data", "Acme"]).is_err());
    }
}
