use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use fipe_core::catalog::{scan_brands, CatalogSource, FileCatalog, StaticCatalog};
use fipe_core::crawl::{CrawlSummary, RunContext, Scheduler, SessionFactory};
use fipe_core::driver::{BrowserLauncher, LaunchOverrides, PortalSessionFactory};
use fipe_core::retry::Pacer;
use fipe_core::sink::{RecordSink, SqliteResultSink};
use fipe_core::{
    load_crawler_config, CatalogError, CheckpointError, CrawlerConfig, DriverError,
    JsonCheckpointStore, SinkError, VehicleSegment,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] fipe_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Refused(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "FIPE catalog crawler control interface", long_about = None)]
pub struct Cli {
    /// Path to crawler.toml
    #[arg(long, default_value = "configs/crawler.toml")]
    pub config: PathBuf,
    /// Override for the data directory (checkpoints, records, catalogs)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a resumable crawl over the brand catalog
    Crawl(CrawlArgs),
    /// Enumerate the brand dropdown and persist the label list
    Scan(ScanArgs),
    /// Summarize checkpoints and collected records per segment
    Status,
    /// Inspect or reset the checkpoint documents
    #[command(subcommand)]
    Checkpoint(CheckpointCommands),
}

#[derive(Args, Debug, Clone)]
pub struct CrawlArgs {
    /// Vehicle segment (cars | motorcycles | trucks); defaults to the config
    #[arg(long)]
    pub segment: Option<String>,
    /// Number of concurrent worker sessions; defaults to the config
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Cap on brands processed this run
    #[arg(long)]
    pub max_brands: Option<usize>,
    /// Cap on models per brand
    #[arg(long)]
    pub max_models: Option<usize>,
    /// Cap on years per model
    #[arg(long)]
    pub max_years: Option<usize>,
    /// Crawl only these brand labels instead of the catalog file
    #[arg(long)]
    pub brands: Vec<String>,
    /// Re-scan the brand dropdown even if a catalog file exists
    #[arg(long)]
    pub rescan: bool,
    /// Run the browser with a visible window
    #[arg(long)]
    pub headed: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// Vehicle segment (cars | motorcycles | trucks); defaults to the config
    #[arg(long)]
    pub segment: Option<String>,
    /// Write the label list somewhere other than the default catalog file
    #[arg(long)]
    pub output: Option<PathBuf>,
    /// Run the browser with a visible window
    #[arg(long)]
    pub headed: bool,
}

#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// Print completed brands and per-brand progress
    Show(CheckpointShowArgs),
    /// Delete the checkpoint documents for a segment
    Clear(CheckpointClearArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CheckpointShowArgs {
    #[arg(long)]
    pub segment: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckpointClearArgs {
    #[arg(long)]
    pub segment: Option<String>,
    /// Required; clearing forgets which work is already done
    #[arg(long)]
    pub yes: bool,
}

pub fn run(cli: Cli) -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match &cli.command {
        Commands::Status => {
            let report = runtime.block_on(context.status())?;
            render(&report, cli.format)
        }
        Commands::Checkpoint(CheckpointCommands::Show(args)) => {
            let report = runtime.block_on(context.checkpoint_show(args))?;
            render(&report, cli.format)
        }
        Commands::Checkpoint(CheckpointCommands::Clear(args)) => {
            let report = runtime.block_on(context.checkpoint_clear(args))?;
            render(&report, cli.format)
        }
        Commands::Scan(args) => {
            let report = runtime.block_on(context.scan(args))?;
            render(&report, cli.format)
        }
        Commands::Crawl(args) => {
            let summary = runtime.block_on(context.crawl(args))?;
            render(&summary, cli.format)
        }
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: CrawlerConfig,
    data_dir: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_crawler_config(&cli.config)?;
        let data_dir = cli.data_dir.clone().unwrap_or_else(|| config.data_dir());
        Ok(Self { config, data_dir })
    }

    fn segment(&self, requested: &Option<String>) -> Result<VehicleSegment> {
        match requested {
            Some(raw) => raw.parse().map_err(AppError::InvalidArgument),
            None => Ok(self.config.portal.segment),
        }
    }

    fn progress_file(&self, segment: VehicleSegment) -> PathBuf {
        self.data_dir.join(format!("progress_{segment}.json"))
    }

    fn completed_file(&self, segment: VehicleSegment) -> PathBuf {
        self.data_dir.join(format!("completed_{segment}.json"))
    }

    fn records_db(&self, segment: VehicleSegment) -> PathBuf {
        self.data_dir.join(format!("records_{segment}.sqlite"))
    }

    fn catalog_file(&self, segment: VehicleSegment) -> PathBuf {
        self.data_dir.join(format!("brands_{segment}.json"))
    }

    fn checkpoint_store(&self, segment: VehicleSegment) -> JsonCheckpointStore {
        JsonCheckpointStore::new(self.progress_file(segment), self.completed_file(segment))
    }

    async fn status(&self) -> Result<StatusReport> {
        let mut segments = Vec::new();
        for segment in [
            VehicleSegment::Cars,
            VehicleSegment::Motorcycles,
            VehicleSegment::Trucks,
        ] {
            let snapshot = self.checkpoint_store(segment).load().await?;
            let records_path = self.records_db(segment);
            let records = if records_path.exists() {
                SqliteResultSink::builder()
                    .path(&records_path)
                    .create_if_missing(false)
                    .build()?
                    .count()
                    .await?
            } else {
                0
            };
            if snapshot.progress.is_empty() && snapshot.completed.is_empty() && records == 0 {
                continue;
            }
            segments.push(SegmentStatus {
                segment: segment.to_string(),
                brands_completed: snapshot.completed.len(),
                brands_in_progress: snapshot
                    .progress
                    .keys()
                    .filter(|brand| !snapshot.completed.contains(*brand))
                    .count(),
                records,
            });
        }
        Ok(StatusReport { segments })
    }

    async fn checkpoint_show(&self, args: &CheckpointShowArgs) -> Result<CheckpointReport> {
        let segment = self.segment(&args.segment)?;
        let snapshot = self.checkpoint_store(segment).load().await?;
        Ok(CheckpointReport {
            segment: segment.to_string(),
            completed: snapshot.completed.iter().cloned().collect(),
            progress: snapshot
                .progress
                .iter()
                .map(|(brand, models)| (brand.clone(), models.len()))
                .collect(),
        })
    }

    async fn checkpoint_clear(&self, args: &CheckpointClearArgs) -> Result<ClearReport> {
        let segment = self.segment(&args.segment)?;
        if !args.yes {
            return Err(AppError::Refused(
                "checkpoint clear discards resume state; pass --yes to confirm".to_string(),
            ));
        }
        self.checkpoint_store(segment).clear().await?;
        Ok(ClearReport {
            segment: segment.to_string(),
            cleared: true,
        })
    }

    async fn scan(&self, args: &ScanArgs) -> Result<ScanReport> {
        let segment = self.segment(&args.segment)?;
        let output = args
            .output
            .clone()
            .unwrap_or_else(|| self.catalog_file(segment));

        let (browser, factory) = self.open_browser(segment, args.headed).await?;
        let result = async {
            let mut driver = factory.open_session().await?;
            scan_brands(&mut driver).await
        }
        .await;
        drop(factory);
        shutdown_browser(browser).await;
        let brands = result?;

        FileCatalog::new(&output).save(&brands)?;
        Ok(ScanReport {
            segment: segment.to_string(),
            count: brands.len(),
            output,
            brands,
        })
    }

    async fn crawl(&self, args: &CrawlArgs) -> Result<CrawlSummary> {
        let segment = self.segment(&args.segment)?;

        let mut config = self.config.clone();
        config.portal.segment = segment;
        config.crawl.max_models = args.max_models.or(config.crawl.max_models);
        config.crawl.max_years = args.max_years.or(config.crawl.max_years);
        let max_brands = args.max_brands.or(config.crawl.max_brands);
        let concurrency = args.concurrency.unwrap_or(config.crawl.concurrency);

        let checkpoint = Arc::new(self.checkpoint_store(segment));
        let sink = Arc::new(SqliteResultSink::new(self.records_db(segment))?);
        sink.initialize()?;
        let ctx = Arc::new(RunContext::new(&config, checkpoint, sink));

        let (browser, factory) = self.open_browser_from(&config, args.headed).await?;

        let mut brands = match self.resolve_catalog(args, segment, &factory).await {
            Ok(brands) => brands,
            Err(err) => {
                drop(factory);
                shutdown_browser(browser).await;
                return Err(err);
            }
        };
        if let Some(limit) = max_brands {
            brands.truncate(limit);
        }

        // Finish the unit in flight and stop cleanly on ctrl-c; nothing
        // already checkpointed is lost.
        let stop = ctx.stop_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after current units");
                stop.request_stop();
            }
        });

        let factory: Arc<dyn SessionFactory> = Arc::new(factory);
        let scheduler = Scheduler::new(factory, Arc::clone(&ctx));
        let summary = scheduler.run(brands, concurrency).await;

        drop(scheduler);
        shutdown_browser(browser).await;
        Ok(summary)
    }

    async fn resolve_catalog(
        &self,
        args: &CrawlArgs,
        segment: VehicleSegment,
        factory: &PortalSessionFactory,
    ) -> Result<Vec<String>> {
        if !args.brands.is_empty() {
            return Ok(StaticCatalog::new(args.brands.clone()).top_level().await?);
        }
        let catalog = FileCatalog::new(self.catalog_file(segment));
        if !args.rescan {
            match catalog.top_level().await {
                Ok(labels) => return Ok(labels),
                Err(CatalogError::Missing { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        let scanned = self.scan_with(factory).await?;
        catalog.save(&scanned)?;
        Ok(scanned)
    }

    async fn scan_with(&self, factory: &PortalSessionFactory) -> Result<Vec<String>> {
        let mut driver = factory.open_session().await?;
        Ok(scan_brands(&mut driver).await?)
    }

    async fn open_browser(
        &self,
        segment: VehicleSegment,
        headed: bool,
    ) -> Result<(Arc<fipe_core::PortalBrowser>, PortalSessionFactory)> {
        let mut config = self.config.clone();
        config.portal.segment = segment;
        self.open_browser_from(&config, headed).await
    }

    async fn open_browser_from(
        &self,
        config: &CrawlerConfig,
        headed: bool,
    ) -> Result<(Arc<fipe_core::PortalBrowser>, PortalSessionFactory)> {
        let launcher = BrowserLauncher::new(config.chromium.clone());
        let overrides = LaunchOverrides {
            headless: headed.then_some(false),
        };
        let browser = Arc::new(launcher.launch_with_overrides(overrides).await?);
        let factory = PortalSessionFactory::new(
            Arc::clone(&browser),
            config.portal.clone(),
            Pacer::new(&config.pacing),
        );
        Ok((browser, factory))
    }
}

async fn shutdown_browser(browser: Arc<fipe_core::PortalBrowser>) {
    match Arc::try_unwrap(browser) {
        Ok(browser) => {
            if let Err(err) = browser.shutdown().await {
                warn!(error = %err, "browser shutdown failed");
            }
        }
        Err(_) => warn!("browser still referenced at shutdown, leaving it to the OS"),
    }
}

#[derive(Debug, Serialize)]
pub struct SegmentStatus {
    pub segment: String,
    pub brands_completed: usize,
    pub brands_in_progress: usize,
    pub records: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub segments: Vec<SegmentStatus>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        if self.segments.is_empty() {
            return "No crawl data yet.".to_string();
        }
        let mut lines = Vec::new();
        for segment in &self.segments {
            lines.push(format!(
                "{}: {} brands completed, {} in progress, {} records",
                segment.segment,
                segment.brands_completed,
                segment.brands_in_progress,
                segment.records
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CheckpointReport {
    pub segment: String,
    pub completed: Vec<String>,
    pub progress: BTreeMap<String, usize>,
}

impl DisplayFallback for CheckpointReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("segment: {}", self.segment)];
        lines.push(format!("completed brands: {}", self.completed.len()));
        for brand in &self.completed {
            lines.push(format!("  - {brand}"));
        }
        let in_progress: Vec<_> = self
            .progress
            .iter()
            .filter(|(brand, _)| !self.completed.contains(brand))
            .collect();
        if !in_progress.is_empty() {
            lines.push("in progress:".to_string());
            for (brand, models) in in_progress {
                lines.push(format!("  - {brand}: {models} models done"));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ClearReport {
    pub segment: String,
    pub cleared: bool,
}

impl DisplayFallback for ClearReport {
    fn display(&self) -> String {
        format!("checkpoints cleared for segment {}", self.segment)
    }
}

#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub segment: String,
    pub count: usize,
    pub output: PathBuf,
    pub brands: Vec<String>,
}

impl DisplayFallback for ScanReport {
    fn display(&self) -> String {
        format!(
            "{} brands scanned for segment {} -> {}",
            self.count,
            self.segment,
            self.output.display()
        )
    }
}

impl DisplayFallback for CrawlSummary {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{}/{} entries completed ({} fast-skipped, {} failed, {} remaining)",
            self.entries_completed,
            self.entries_total,
            self.entries_fast_skipped,
            self.entries_failed,
            self.entries_remaining
        )];
        lines.push(format!(
            "{} records appended, {} duplicates suppressed",
            self.records_appended, self.duplicates
        ));
        if self.models_skipped > 0 || self.leaves_skipped > 0 {
            lines.push(format!(
                "{} models and {} leaves skipped after retry exhaustion",
                self.models_skipped, self.leaves_skipped
            ));
        }
        if self.catalog_drifts > 0 {
            lines.push(format!(
                "{} entries resumed from the start after catalog drift",
                self.catalog_drifts
            ));
        }
        if self.stopped {
            lines.push("run stopped early by request".to_string());
        }
        for failure in &self.failures {
            lines.push(format!("failed: {} ({})", failure.brand, failure.error));
        }
        lines.push(format!("duration: {}s", self.duration_secs));
        lines.join("\n")
    }
}
