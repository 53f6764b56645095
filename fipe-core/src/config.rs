use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CrawlerConfig {
    pub paths: PathsSection,
    pub portal: PortalSection,
    pub crawl: CrawlSection,
    pub retry: RetrySection,
    pub pacing: PacingSection,
    pub chromium: ChromiumSection,
}

impl CrawlerConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir)
    }

    /// Checkpoint and output files are kept per segment, so crawls of
    /// different vehicle segments never share resume state.
    pub fn progress_file(&self, segment: VehicleSegment) -> PathBuf {
        self.data_dir().join(format!("progress_{segment}.json"))
    }

    pub fn completed_file(&self, segment: VehicleSegment) -> PathBuf {
        self.data_dir().join(format!("completed_{segment}.json"))
    }

    pub fn records_db(&self, segment: VehicleSegment) -> PathBuf {
        self.data_dir().join(format!("records_{segment}.sqlite"))
    }

    pub fn catalog_file(&self, segment: VehicleSegment) -> PathBuf {
        self.data_dir().join(format!("brands_{segment}.json"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
}

/// The three consultation forms hosted by the pricing portal. Each has its
/// own tab and its own set of element ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleSegment {
    Cars,
    Motorcycles,
    Trucks,
}

impl fmt::Display for VehicleSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VehicleSegment::Cars => "cars",
            VehicleSegment::Motorcycles => "motorcycles",
            VehicleSegment::Trucks => "trucks",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for VehicleSegment {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "cars" | "carros" => Ok(VehicleSegment::Cars),
            "motorcycles" | "motos" => Ok(VehicleSegment::Motorcycles),
            "trucks" | "caminhoes" => Ok(VehicleSegment::Trucks),
            other => Err(format!("invalid vehicle segment: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalSection {
    pub base_url: String,
    pub segment: VehicleSegment,
    pub navigation_timeout_secs: u64,
    pub dropdown_timeout_secs: u64,
    pub result_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlSection {
    pub concurrency: usize,
    pub max_brands: Option<usize>,
    pub max_models: Option<usize>,
    pub max_years: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub delay_ms: u64,
}

/// Randomized delay ranges in milliseconds, `[min, max]`. A `[0, 0]` range
/// disables the tier, which is how tests run without wall-clock pauses.
#[derive(Debug, Clone, Deserialize)]
pub struct PacingSection {
    pub interaction_delay_ms: [u64; 2],
    pub unit_delay_ms: [u64; 2],
    pub entry_delay_ms: [u64; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub mute_audio: bool,
    pub window: [u32; 2],
}

pub fn load_crawler_config<P: AsRef<Path>>(path: P) -> Result<CrawlerConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
