use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::driver::{ChoiceList, DriverResult, UiDriver};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Read { source: io::Error, path: PathBuf },
    #[error("failed to write catalog {path}: {source}")]
    Write { source: io::Error, path: PathBuf },
    #[error("failed to decode catalog {path}: {source}")]
    Decode {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("catalog {path} does not exist; run a scan first")]
    Missing { path: PathBuf },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Ordered top-level (brand) labels for a crawl. Mid-level and leaf
/// labels are never pre-materialized; the engine reads them live because
/// they can change between runs.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn top_level(&self) -> CatalogResult<Vec<String>>;
}

/// In-memory label list, used for tests and for `--brands` overrides.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    labels: Vec<String>,
}

impl StaticCatalog {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn top_level(&self) -> CatalogResult<Vec<String>> {
        Ok(self.labels.clone())
    }
}

/// Brand labels persisted by a previous scan, one JSON array per segment.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> CatalogResult<Vec<String>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CatalogError::Missing {
                    path: self.path.clone(),
                })
            }
            Err(source) => {
                return Err(CatalogError::Read {
                    source,
                    path: self.path.clone(),
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| CatalogError::Decode {
            source,
            path: self.path.clone(),
        })
    }

    pub fn save(&self, labels: &[String]) -> CatalogResult<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|source| CatalogError::Write {
            source,
            path: self.path.clone(),
        })?;
        let json = serde_json::to_string_pretty(labels).map_err(|source| CatalogError::Decode {
            source,
            path: self.path.clone(),
        })?;
        let temp = tempfile::NamedTempFile::new_in(parent).map_err(|source| {
            CatalogError::Write {
                source,
                path: self.path.clone(),
            }
        })?;
        std::fs::write(temp.path(), json).map_err(|source| CatalogError::Write {
            source,
            path: self.path.clone(),
        })?;
        temp.persist(&self.path)
            .map_err(|source| CatalogError::Write {
                source: source.error,
                path: self.path.clone(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl CatalogSource for FileCatalog {
    async fn top_level(&self) -> CatalogResult<Vec<String>> {
        self.load()
    }
}

/// One live enumeration of the brand dropdown through an open session.
pub async fn scan_brands(driver: &mut dyn UiDriver) -> DriverResult<Vec<String>> {
    let brands = driver.enumerate_labels(ChoiceList::Brand).await?;
    info!(count = brands.len(), "scanned brand catalog");
    Ok(brands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_catalog_round_trips_labels() {
        let dir = tempdir().unwrap();
        let catalog = FileCatalog::new(dir.path().join("brands.json"));
        let labels = vec!["HONDA".to_string(), "YAMAHA".to_string()];
        catalog.save(&labels).unwrap();
        assert_eq!(catalog.top_level().await.unwrap(), labels);
    }

    #[tokio::test]
    async fn missing_catalog_is_a_distinct_error() {
        let dir = tempdir().unwrap();
        let catalog = FileCatalog::new(dir.path().join("absent.json"));
        match catalog.top_level().await {
            Err(CatalogError::Missing { .. }) => {}
            other => panic!("expected Missing, got {other:?}"),
        }
    }
}
