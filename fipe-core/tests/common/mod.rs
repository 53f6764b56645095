#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fipe_core::checkpoint::JsonCheckpointStore;
use fipe_core::config::RetrySection;
use fipe_core::crawl::{RunContext, SessionFactory, StopHandle};
use fipe_core::driver::{ChoiceList, DriverError, DriverResult, UiDriver};
use fipe_core::retry::{Pacer, RetryPolicy};
use fipe_core::sink::{ExtractedRecord, SqliteResultSink};

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub label: String,
    pub years: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BrandSpec {
    pub label: String,
    pub models: Vec<ModelSpec>,
}

/// Deterministic portal stand-in shared by every mock session of a test.
/// Selection state lives in the driver; the fixture carries the catalog,
/// the labels scripted to fail selection, and the operation log.
pub struct Fixture {
    brands: Vec<BrandSpec>,
    fail_labels: HashSet<String>,
    ops: Mutex<Vec<String>>,
    searches: AtomicUsize,
}

impl Fixture {
    pub fn new(catalog: &[(&str, &[(&str, &[&str])])]) -> Arc<Self> {
        Self::with_failing(catalog, &[])
    }

    pub fn with_failing(catalog: &[(&str, &[(&str, &[&str])])], fail: &[&str]) -> Arc<Self> {
        let brands = catalog
            .iter()
            .map(|(brand, models)| BrandSpec {
                label: (*brand).to_string(),
                models: models
                    .iter()
                    .map(|(model, years)| ModelSpec {
                        label: (*model).to_string(),
                        years: years.iter().map(|year| (*year).to_string()).collect(),
                    })
                    .collect(),
            })
            .collect();
        Arc::new(Self {
            brands,
            fail_labels: fail.iter().map(|label| (*label).to_string()).collect(),
            ops: Mutex::new(Vec::new()),
            searches: AtomicUsize::new(0),
        })
    }

    fn brand(&self, label: &str) -> Option<&BrandSpec> {
        self.brands
            .iter()
            .find(|brand| brand.label.eq_ignore_ascii_case(label))
    }

    fn log(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn op_count(&self, prefix: &str) -> usize {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

/// The record a mock session yields for one leaf, including the identity
/// fields the engine stamps on. Tests use it to pre-seed the sink when
/// simulating crashes.
pub fn expected_record(brand: &str, model: &str, year: &str) -> ExtractedRecord {
    let mut record = ExtractedRecord::new();
    record.insert("Marca".to_string(), brand.to_string());
    record.insert("Modelo".to_string(), model.to_string());
    record.insert("Ano Modelo".to_string(), year.to_string());
    record.insert("Preço Médio".to_string(), "R$ 10.000,00".to_string());
    record.insert("Mês de referência".to_string(), "julho de 2025".to_string());
    record.insert("MarcaSelecionada".to_string(), brand.to_string());
    record.insert("ModeloSelecionado".to_string(), model.to_string());
    record.insert("AnoSelecionado".to_string(), year.to_string());
    record
}

pub struct MockDriver {
    fixture: Arc<Fixture>,
    brand: Option<String>,
    model: Option<String>,
    year: Option<String>,
    form_submitted: bool,
    has_result: bool,
}

impl MockDriver {
    pub fn new(fixture: Arc<Fixture>) -> Self {
        Self {
            fixture,
            brand: None,
            model: None,
            year: None,
            form_submitted: false,
            has_result: false,
        }
    }

    fn labels_of(&self, list: ChoiceList) -> DriverResult<Vec<String>> {
        match list {
            ChoiceList::ReferenceMonth => Ok(vec!["julho de 2025".to_string()]),
            ChoiceList::Brand => Ok(self
                .fixture
                .brands
                .iter()
                .map(|brand| brand.label.clone())
                .collect()),
            ChoiceList::Model => {
                let brand = self.brand.as_deref().ok_or_else(|| {
                    DriverError::Unexpected("model list read without a brand selected".to_string())
                })?;
                let brand = self
                    .fixture
                    .brand(brand)
                    .ok_or_else(|| DriverError::Unexpected("selected brand vanished".to_string()))?;
                Ok(brand.models.iter().map(|model| model.label.clone()).collect())
            }
            ChoiceList::Year => {
                let brand = self.brand.as_deref().ok_or_else(|| {
                    DriverError::Unexpected("year list read without a brand selected".to_string())
                })?;
                let model = self.model.as_deref().ok_or_else(|| {
                    DriverError::Unexpected("year list read without a model selected".to_string())
                })?;
                let brand = self
                    .fixture
                    .brand(brand)
                    .ok_or_else(|| DriverError::Unexpected("selected brand vanished".to_string()))?;
                let model = brand
                    .models
                    .iter()
                    .find(|candidate| candidate.label.eq_ignore_ascii_case(model))
                    .ok_or_else(|| DriverError::Unexpected("selected model vanished".to_string()))?;
                Ok(model.years.clone())
            }
        }
    }

    fn guard_form(&self, op: &str) -> DriverResult<()> {
        // A submitted search leaves stale selections behind; interacting
        // with the form again without a reset is the bug the engine must
        // never commit.
        if self.form_submitted {
            return Err(DriverError::Unexpected(format!(
                "{op} on a form that was not reset after a search"
            )));
        }
        Ok(())
    }

    fn apply_selection(&mut self, list: ChoiceList, label: &str) -> DriverResult<()> {
        if self.fixture.fail_labels.contains(label) {
            return Err(DriverError::SelectionMismatch {
                requested: label.to_string(),
                echoed: "Selecione".to_string(),
            });
        }
        let known = self.labels_of(list)?;
        let resolved = known
            .iter()
            .find(|candidate| candidate.eq_ignore_ascii_case(label))
            .cloned()
            .ok_or_else(|| DriverError::ElementNotFound(format!("{list} option {label:?}")))?;
        match list {
            ChoiceList::ReferenceMonth => {}
            ChoiceList::Brand => {
                self.brand = Some(resolved);
                self.model = None;
                self.year = None;
            }
            ChoiceList::Model => {
                self.model = Some(resolved);
                self.year = None;
            }
            ChoiceList::Year => {
                self.year = Some(resolved);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UiDriver for MockDriver {
    async fn select_by_label(&mut self, list: ChoiceList, label: &str) -> DriverResult<()> {
        self.fixture.log(format!("select_label {list} {label}"));
        self.guard_form("select_by_label")?;
        self.apply_selection(list, label)
    }

    async fn select_by_index(&mut self, list: ChoiceList, index: usize) -> DriverResult<()> {
        self.fixture.log(format!("select_index {list} {index}"));
        self.guard_form("select_by_index")?;
        let known = self.labels_of(list)?;
        let label = known
            .get(index)
            .cloned()
            .ok_or_else(|| DriverError::ElementNotFound(format!("{list} index {index}")))?;
        self.apply_selection(list, &label)
    }

    async fn enumerate_labels(&mut self, list: ChoiceList) -> DriverResult<Vec<String>> {
        self.fixture.log(format!("enumerate {list}"));
        self.guard_form("enumerate_labels")?;
        self.labels_of(list)
    }

    async fn submit_search(&mut self) -> DriverResult<()> {
        self.fixture.log("submit".to_string());
        self.guard_form("submit_search")?;
        if self.brand.is_none() || self.model.is_none() || self.year.is_none() {
            return Err(DriverError::Unexpected(
                "search submitted with incomplete selections".to_string(),
            ));
        }
        self.fixture.searches.fetch_add(1, Ordering::SeqCst);
        self.form_submitted = true;
        self.has_result = true;
        Ok(())
    }

    async fn wait_for_result_view(&mut self, _timeout: Duration) -> DriverResult<()> {
        if self.has_result {
            Ok(())
        } else {
            Err(DriverError::Timeout("result view".to_string()))
        }
    }

    async fn extract_record(&mut self) -> DriverResult<ExtractedRecord> {
        if !self.has_result {
            return Err(DriverError::ElementNotFound("result table".to_string()));
        }
        let brand = self.brand.clone().unwrap_or_default();
        let model = self.model.clone().unwrap_or_default();
        let year = self.year.clone().unwrap_or_default();
        let mut record = ExtractedRecord::new();
        record.insert("Marca".to_string(), brand);
        record.insert("Modelo".to_string(), model);
        record.insert("Ano Modelo".to_string(), year);
        record.insert("Preço Médio".to_string(), "R$ 10.000,00".to_string());
        record.insert("Mês de referência".to_string(), "julho de 2025".to_string());
        Ok(record)
    }

    async fn reset_search(&mut self) -> DriverResult<()> {
        self.fixture.log("reset".to_string());
        self.brand = None;
        self.model = None;
        self.year = None;
        self.form_submitted = false;
        self.has_result = false;
        Ok(())
    }
}

pub struct MockSessionFactory {
    fixture: Arc<Fixture>,
}

impl MockSessionFactory {
    pub fn new(fixture: Arc<Fixture>) -> Self {
        Self { fixture }
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create(&self) -> DriverResult<Box<dyn UiDriver>> {
        Ok(Box::new(MockDriver::new(Arc::clone(&self.fixture))))
    }
}

/// A factory whose sessions never come up, for worker-retirement tests.
pub struct DeadSessionFactory;

#[async_trait]
impl SessionFactory for DeadSessionFactory {
    async fn create(&self) -> DriverResult<Box<dyn UiDriver>> {
        Err(DriverError::Launch("no browser available".to_string()))
    }
}

pub struct TestWorld {
    pub ctx: Arc<RunContext>,
    pub checkpoint: Arc<JsonCheckpointStore>,
    pub sink: Arc<SqliteResultSink>,
}

/// Context over real stores in `dir`, with pacing disabled and a small
/// fast retry policy.
pub fn world_in(dir: &Path) -> TestWorld {
    let checkpoint = Arc::new(JsonCheckpointStore::new(
        dir.join("progress.json"),
        dir.join("completed.json"),
    ));
    let sink = Arc::new(SqliteResultSink::new(dir.join("records.sqlite")).unwrap());
    sink.initialize().unwrap();
    let ctx = Arc::new(RunContext {
        checkpoint: Arc::clone(&checkpoint),
        sink: sink.clone(),
        retry: RetryPolicy::new(RetrySection {
            max_attempts: 3,
            delay_ms: 0,
        }),
        pacer: Pacer::disabled(),
        stop: StopHandle::new(),
        max_models: None,
        max_years: None,
        result_timeout: Duration::from_secs(1),
    });
    TestWorld {
        ctx,
        checkpoint,
        sink,
    }
}
