//! Command implementations. Results go to stdout, diagnostics to the log.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use contentflow_client::api::{FilesApi, JobsApi};
use contentflow_client::batch::{BatchCoordinator, BatchOutcome};
use contentflow_client::http::HttpBackend;
use contentflow_client::launcher::JobLauncher;
use contentflow_client::listing::FileListing;
use contentflow_client::logs::{LogEvent, LogStreamClient};
use contentflow_client::poller::{JobPoller, PollOutcome};
use contentflow_client::review::DiffReviewController;
use contentflow_client::store::{JobStore, StoreEvent};
use contentflow_client::ClientConfig;
use contentflow_core::batch::{
    BatchPayload, BrandDataRequest, BriefRequest, DraftRequest, EditRequest, SubmissionPayload,
};
use contentflow_core::diff::FileType;
use contentflow_core::files::{FileKind, WordCountBand};
use contentflow_core::job::JobStatus;
use contentflow_core::log_tail::LogTail;
use futures::StreamExt;
use serde::de::DeserializeOwned;

pub struct App {
    backend: Arc<HttpBackend>,
    store: JobStore,
    poller: JobPoller,
    logs: LogStreamClient,
}

impl App {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let backend = Arc::new(HttpBackend::new(&config)?);
        let store = JobStore::new();
        let poller = JobPoller::new(backend.clone(), store.clone(), config.poll.clone());
        let logs = LogStreamClient::new(backend.clone(), config.log_stream.clone());
        Ok(Self {
            backend,
            store,
            poller,
            logs,
        })
    }

    // ---- single jobs ----

    pub async fn brand_data(
        &self,
        brand_name: String,
        urls: Vec<String>,
        follow: bool,
    ) -> anyhow::Result<()> {
        self.run_job(&BrandDataRequest { brand_name, urls }, follow).await
    }

    pub async fn brief(
        &self,
        title: String,
        primary_keyword: String,
        secondary_keywords: String,
        brand_data: String,
        follow: bool,
    ) -> anyhow::Result<()> {
        let request = BriefRequest {
            title,
            primary_keyword,
            secondary_keywords,
            brand_data,
        };
        self.run_job(&request, follow).await
    }

    pub async fn draft(
        &self,
        brief_filename: String,
        brand_data_filename: String,
        follow: bool,
    ) -> anyhow::Result<()> {
        let request = DraftRequest {
            brief_filename,
            brand_data_filename,
        };
        self.run_job(&request, follow).await
    }

    pub async fn edit(
        &self,
        kind: FileKind,
        filename: String,
        instructions: String,
        wait: bool,
    ) -> anyhow::Result<()> {
        let file_type = match kind {
            FileKind::Brief => FileType::Brief,
            FileKind::Draft => FileType::Draft,
            FileKind::BrandData => bail!("brand data cannot be edited by an AI job"),
        };
        let request = EditRequest {
            file_type,
            filename,
            instructions,
        };

        let launched = self.launcher().launch(&request).await?;
        let job_id = launched.job_id().clone();
        println!("Submitted {} job {job_id}", request.job_type().label());
        if !wait {
            return Ok(());
        }

        let outcome = self.track(launched.finished()).await;
        report_outcome(&job_id, outcome)?;
        match self.store.get(&job_id).and_then(|job| job.diff_id) {
            Some(diff_id) => println!("Proposed changes ready for review: {diff_id}"),
            None => println!("The job finished without proposing changes"),
        }
        Ok(())
    }

    async fn run_job<P: SubmissionPayload>(&self, payload: &P, follow: bool) -> anyhow::Result<()> {
        let launched = self.launcher().launch(payload).await?;
        let job_id = launched.job_id().clone();
        println!("Submitted {} job {job_id}", payload.job_type().label());

        if follow {
            self.logs(&job_id, None).await?;
        }
        let outcome = self.track(launched.finished()).await;
        report_outcome(&job_id, outcome)?;

        if let Some(job) = self.store.get(&job_id) {
            for file in &job.output_files {
                println!("  {file}");
            }
        }
        Ok(())
    }

    fn launcher(&self) -> JobLauncher {
        JobLauncher::new(self.backend.clone(), self.poller.clone())
    }

    // ---- batches ----

    pub async fn batch_briefs(&self, file: &Path, yes: bool) -> anyhow::Result<()> {
        self.batch::<BriefRequest>(file, yes).await
    }

    pub async fn batch_drafts(&self, file: &Path, yes: bool) -> anyhow::Result<()> {
        self.batch::<DraftRequest>(file, yes).await
    }

    async fn batch<E: BatchPayload + DeserializeOwned>(
        &self,
        file: &Path,
        yes: bool,
    ) -> anyhow::Result<()> {
        let raw = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        let entries: Vec<E> =
            serde_json::from_str(&raw).context("batch file must hold a JSON array of entries")?;

        let batches = BatchCoordinator::<E>::new(self.backend.clone(), self.poller.clone());
        batches.edit_form(|form| {
            for (index, entry) in entries.into_iter().enumerate() {
                if index > 0 {
                    form.add_entry()?;
                }
                form.update_entry(index, entry)?;
            }
            Ok(())
        })?;

        let prepared = batches.prepare()?;
        let confirmed = if prepared.needs_confirmation() {
            if !yes {
                bail!(
                    "{} incomplete entries would be skipped; rerun with --yes to submit the other {}",
                    prepared.skipped(),
                    prepared.len()
                );
            }
            println!("Skipping {} incomplete entries", prepared.skipped());
            prepared.confirm()
        } else {
            prepared.into_confirmed()?
        };

        let run = batches.submit(confirmed).await?;
        println!("Batch {} submitted with {} jobs", run.batch_id(), run.total_jobs());
        for job_id in run.job_ids() {
            println!("  {job_id}");
        }

        match self.track(run.finished()).await {
            BatchOutcome::Completed { completed, failed } => {
                println!("Batch finished: {completed} completed, {failed} failed");
                Ok(())
            }
            BatchOutcome::Abandoned {
                settled,
                unfinished,
            } => bail!(
                "stopped following the batch with {unfinished} jobs unfinished ({settled} settled)"
            ),
        }
    }

    // ---- status and logs ----

    pub async fn status(&self, job_id: &str, watch: bool) -> anyhow::Result<()> {
        let report = self.backend.job_status(job_id).await?;
        if !watch || report.status.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        self.store.add(report.into_job());
        print_job(&self.store, job_id);
        let handle = self.poller.start(job_id)?;
        let outcome = self.track(handle.join()).await;
        report_outcome(job_id, outcome)
    }

    pub async fn logs(&self, job_id: &str, output: Option<&Path>) -> anyhow::Result<()> {
        let mut subscription = self.logs.subscribe(job_id);
        let control = subscription.control();
        let mut tail = LogTail::new();
        let mut failure = None;

        loop {
            tokio::select! {
                event = subscription.next() => match event {
                    Some(LogEvent::Line(line)) => {
                        println!("{line}");
                        tail.push(line);
                    }
                    Some(LogEvent::Complete(payload)) => {
                        tracing::info!(job_id, payload = %payload, "Log stream complete");
                    }
                    Some(LogEvent::Error(e)) => failure = Some(e),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    control.close();
                }
            }
        }

        if let Some(path) = output {
            let path = if path.is_dir() {
                path.join(LogTail::download_name(&job_id.to_string()))
            } else {
                path.to_path_buf()
            };
            tokio::fs::write(&path, tail.export_text())
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Saved {} lines to {}", tail.len(), path.display());
        }

        match failure {
            Some(e) => Err(anyhow::Error::new(e).context(format!("log stream of job {job_id}"))),
            None => Ok(()),
        }
    }

    /// Wait for `finished` while printing status changes. Ctrl-C stops
    /// every poller, which makes `finished` resolve.
    async fn track<T>(&self, finished: impl Future<Output = T>) -> T {
        let mut events = self.store.events();
        tokio::pin!(finished);

        loop {
            tokio::select! {
                result = &mut finished => return result,
                event = events.recv() => {
                    if let Ok(StoreEvent::Updated { id, .. }) = event {
                        print_job(&self.store, &id);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    self.poller.shutdown();
                }
            }
        }
    }

    // ---- diffs ----

    pub async fn diff_show(&self, diff_id: &str) -> anyhow::Result<()> {
        let review = self.review(diff_id).await?;
        let session = review.session();
        let Some(diff) = session.diff() else {
            bail!("diff {diff_id} did not load");
        };

        println!("{} {} ({diff_id})", diff.file_type.label(), diff.filename);
        println!("--- original");
        println!("{}", diff.original_content);
        println!("+++ proposed");
        println!("{}", diff.edited_content);
        if !diff.has_changes() {
            println!("(no changes)");
        }
        Ok(())
    }

    pub async fn diff_approve(&self, diff_id: &str, content: Option<&Path>) -> anyhow::Result<()> {
        let review = self.review(diff_id).await?;
        let decision = match content {
            Some(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                review.approve(text).await?
            }
            None => review.approve_current().await?,
        };
        println!("Applied changes to {}", decision.filename());
        Ok(())
    }

    pub async fn diff_reject(&self, diff_id: &str) -> anyhow::Result<()> {
        let review = self.review(diff_id).await?;
        let decision = review.reject().await?;
        println!("Discarded changes to {}", decision.filename());
        Ok(())
    }

    async fn review(&self, diff_id: &str) -> anyhow::Result<DiffReviewController> {
        let listing = Arc::new(FileListing::new(self.backend.clone()));
        let review =
            DiffReviewController::new(self.backend.clone(), diff_id).with_refresher(listing);
        review.load().await?;
        Ok(review)
    }

    // ---- files ----

    pub async fn files(&self, kind: FileKind) -> anyhow::Result<()> {
        let files = FileListing::new(self.backend.clone()).reload(kind).await?;
        if files.is_empty() {
            println!("No {} yet", kind.path_segment());
        }

        for file in &files {
            let created = file
                .created_at_utc()
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            let size = match (kind, file.size) {
                (FileKind::BrandData, Some(bytes)) => format!("{bytes} bytes"),
                (FileKind::Draft, Some(words)) => {
                    format!("{words} words, {}", band_label(WordCountBand::classify(words)))
                }
                (_, Some(words)) => format!("{words} words"),
                (_, None) => String::new(),
            };
            println!("{created:16}  {:40}  {size}", file.display_name());
        }
        Ok(())
    }

    pub async fn show(&self, kind: FileKind, filename: &str) -> anyhow::Result<()> {
        let content = self.backend.read_file(kind, filename).await?;
        println!("{content}");
        Ok(())
    }

    pub async fn save(&self, kind: FileKind, filename: &str, source: &Path) -> anyhow::Result<()> {
        let content = tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("reading {}", source.display()))?;
        self.backend.save_file(kind, filename, &content).await?;
        println!("Saved {filename}");
        Ok(())
    }
}

fn print_job(store: &JobStore, job_id: &str) {
    let Some(job) = store.get(job_id) else {
        return;
    };
    match (job.status, job.queue_position) {
        (JobStatus::Queued, Some(position)) => {
            println!("{job_id}  {}  queued (position {position})", job.job_type.label())
        }
        (status, _) => println!("{job_id}  {}  {status}", job.job_type.label()),
    }
}

fn report_outcome(job_id: &str, outcome: PollOutcome) -> anyhow::Result<()> {
    match outcome {
        PollOutcome::Terminal(JobStatus::Completed) => {
            println!("Job {job_id} completed");
            Ok(())
        }
        PollOutcome::Terminal(status) => bail!("job {job_id} ended as {status}"),
        PollOutcome::Cancelled | PollOutcome::Removed => bail!("stopped following job {job_id}"),
        PollOutcome::GaveUp { failures } => {
            bail!("gave up on job {job_id} after {failures} failed status requests")
        }
    }
}

fn band_label(band: WordCountBand) -> &'static str {
    match band {
        WordCountBand::Under => "under target",
        WordCountBand::Optimal => "optimal",
        WordCountBand::OverLimit => "over limit",
    }
}
