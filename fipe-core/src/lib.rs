pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod crawl;
pub mod driver;
pub mod error;
pub mod retry;
pub mod sink;
mod sqlite;

pub use catalog::{CatalogError, CatalogSource, FileCatalog, StaticCatalog};
pub use checkpoint::{
    CheckpointError, CheckpointSnapshot, CompletedSet, JsonCheckpointStore, ProgressMap,
};
pub use config::{load_crawler_config, CrawlerConfig, VehicleSegment};
pub use crawl::{
    CrawlError, CrawlResult, CrawlSummary, EntryOutcome, RunContext, Scheduler, SessionFactory,
    StopHandle, TraversalEngine,
};
pub use driver::{
    BrowserLauncher, ChoiceList, ChosenDriver, DriverError, DriverResult, LaunchOverrides,
    PortalBrowser, PortalSessionFactory, SegmentSelectors, UiDriver,
};
pub use error::{ConfigError, Result};
pub use retry::{Pacer, RetryPolicy};
pub use sink::{ExtractedRecord, RecordSink, SinkError, SqliteResultSink};
