use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::resume_point;
use crate::driver::{ChoiceList, DriverResult, UiDriver};
use crate::retry::RetryPolicy;
use crate::sink::{ExtractedRecord, RecordSink};

use super::{CrawlError, CrawlResult, RunContext};

/// What happened while processing one top-level entry. Logged at the end
/// of the entry and aggregated into the crawl summary.
#[derive(Debug, Clone, Serialize, Default)]
pub struct EntryOutcome {
    pub brand: String,
    pub fast_skipped: bool,
    pub entry_done: bool,
    pub interrupted: bool,
    pub resumed_from: usize,
    pub catalog_drift: bool,
    pub models_total: usize,
    pub models_processed: usize,
    pub models_skipped: usize,
    pub models_without_years: usize,
    pub records_appended: usize,
    pub duplicates: usize,
    pub leaves_skipped: usize,
    pub duration_secs: u64,
    pub errors: Vec<String>,
}

impl EntryOutcome {
    fn new(brand: &str) -> Self {
        Self {
            brand: brand.to_string(),
            ..Default::default()
        }
    }
}

/// Walks one top-level entry end to end: select the brand, enumerate its
/// models, and for every model from the resume point onward select each
/// year, run the search and commit the extracted record. Labels are the
/// only identity used across page resets; indices never survive one
/// enumeration pass.
pub struct TraversalEngine {
    driver: Box<dyn UiDriver>,
    ctx: Arc<RunContext>,
    /// Set after any search submission. Submitting leaves the form in a
    /// state where stale selections can silently persist, so the next
    /// unit must reset and re-apply selections before proceeding.
    form_dirty: bool,
}

impl TraversalEngine {
    pub fn new(driver: Box<dyn UiDriver>, ctx: Arc<RunContext>) -> Self {
        Self {
            driver,
            ctx,
            form_dirty: false,
        }
    }

    pub async fn run_entry(&mut self, brand: &str) -> CrawlResult<EntryOutcome> {
        let started = Instant::now();
        let mut outcome = EntryOutcome::new(brand);

        if self.ctx.checkpoint.is_entry_done(brand).await? {
            debug!(brand, "entry already complete, fast skip");
            outcome.fast_skipped = true;
            outcome.entry_done = true;
            return Ok(outcome);
        }

        // Failing to select the brand at all abandons the entry; the
        // worker logs it and moves on to the next queue item.
        let retry = self.ctx.retry.clone();
        select_in_list(self.driver.as_mut(), &retry, ChoiceList::Brand, brand, None).await?;

        let mut models = self.driver.enumerate_labels(ChoiceList::Model).await?;
        truncate_to(self.ctx.max_models, &mut models);
        outcome.models_total = models.len();

        let done = self.ctx.checkpoint.completed_mids(brand).await?;
        if let (Some(last_done), Some(last_available)) = (done.last(), models.last()) {
            if last_done == last_available {
                info!(brand, models = models.len(), "all models already checkpointed");
                self.ctx.checkpoint.record_entry_done(brand).await?;
                outcome.entry_done = true;
                outcome.duration_secs = started.elapsed().as_secs();
                return Ok(outcome);
            }
        }

        let resume = resume_point(done.last().map(String::as_str), &models);
        if resume.drifted {
            warn!(
                brand,
                last_done = done.last().map(String::as_str).unwrap_or(""),
                "checkpointed model absent from fresh enumeration, resuming from the start"
            );
            outcome.catalog_drift = true;
        }
        outcome.resumed_from = resume.index;
        if resume.index > 0 {
            info!(brand, resume_from = resume.index, "resuming from checkpoint");
        }

        for (model_index, model) in models.iter().enumerate().skip(resume.index) {
            let model = model.as_str();
            if self.ctx.stop.is_stop_requested() {
                outcome.interrupted = true;
                break;
            }
            match self.process_model(brand, model, model_index, &mut outcome).await {
                Ok(()) => {}
                Err(CrawlError::Driver(err)) => {
                    // Retry exhaustion on this model: its leaves are never
                    // attempted and it is not retried within this run.
                    warn!(brand, model, error = %err, "model skipped");
                    outcome.models_skipped += 1;
                    outcome.errors.push(format!("{model}: {err}"));
                }
                Err(other) => return Err(other),
            }
        }

        if !outcome.interrupted {
            self.ctx.checkpoint.record_entry_done(brand).await?;
            outcome.entry_done = true;
        }
        outcome.duration_secs = started.elapsed().as_secs();
        info!(
            brand,
            processed = outcome.models_processed,
            skipped = outcome.models_skipped,
            records = outcome.records_appended,
            duplicates = outcome.duplicates,
            interrupted = outcome.interrupted,
            "entry finished"
        );
        Ok(outcome)
    }

    async fn process_model(
        &mut self,
        brand: &str,
        model: &str,
        model_index: usize,
        outcome: &mut EntryOutcome,
    ) -> CrawlResult<()> {
        let retry = self.ctx.retry.clone();

        if self.form_dirty {
            self.driver.reset_search().await?;
            self.form_dirty = false;
        }
        // Defensive: some form resets drop the parent selection.
        select_in_list(self.driver.as_mut(), &retry, ChoiceList::Brand, brand, None).await?;
        self.select_model(brand, model, model_index).await?;

        let mut years = self.driver.enumerate_labels(ChoiceList::Year).await?;
        truncate_to(self.ctx.max_years, &mut years);
        if years.is_empty() {
            info!(brand, model, "model has no year options, skipping");
            outcome.models_without_years += 1;
            return Ok(());
        }

        for (year_index, year) in years.iter().enumerate() {
            let year = year.as_str();
            if self.ctx.stop.is_stop_requested() {
                outcome.interrupted = true;
                break;
            }
            if self.form_dirty {
                if let Err(err) = self.reapply_selections(brand, model, model_index).await {
                    if err.is_transient() {
                        warn!(brand, model, year, error = %err, "leaf skipped, reselect failed");
                        outcome.leaves_skipped += 1;
                        outcome.errors.push(format!("{model}/{year}: {err}"));
                        continue;
                    }
                    return Err(err.into());
                }
                self.form_dirty = false;
            }
            match self.process_leaf(brand, model, year, year_index, outcome).await {
                Ok(()) => {}
                Err(CrawlError::Driver(err)) => {
                    warn!(brand, model, year, error = %err, "leaf skipped");
                    outcome.leaves_skipped += 1;
                    outcome.errors.push(format!("{model}/{year}: {err}"));
                }
                Err(other) => return Err(other),
            }
        }

        outcome.models_processed += 1;
        Ok(())
    }

    async fn process_leaf(
        &mut self,
        brand: &str,
        model: &str,
        year: &str,
        year_index: usize,
        outcome: &mut EntryOutcome,
    ) -> CrawlResult<()> {
        let retry = self.ctx.retry.clone();
        select_in_list(
            self.driver.as_mut(),
            &retry,
            ChoiceList::Year,
            year,
            Some(year_index),
        )
        .await?;

        let mut record = self.search_and_extract().await?;
        record.insert("MarcaSelecionada".to_string(), brand.to_string());
        record.insert("ModeloSelecionado".to_string(), model.to_string());
        record.insert("AnoSelecionado".to_string(), year.to_string());

        // Sink first, checkpoint second: a crash in between re-extracts
        // one leaf whose re-append the sink deduplicates.
        let appended = self.ctx.sink.append(&record).await?;
        if appended {
            outcome.records_appended += 1;
        } else {
            outcome.duplicates += 1;
        }
        self.ctx.checkpoint.record_leaf_done(brand, model).await?;
        debug!(brand, model, year, appended, "leaf committed");

        self.ctx.pacer.between_units().await;
        Ok(())
    }

    /// Submit, wait for the result view and read the table. A timeout
    /// re-clicks the submit control, bounded by the retry policy.
    async fn search_and_extract(&mut self) -> DriverResult<ExtractedRecord> {
        let retry = self.ctx.retry.clone();
        let timeout = self.ctx.result_timeout;
        self.form_dirty = true;
        retry
            .run_with("submit search", self.driver.as_mut(), move |driver, _| {
                Box::pin(async move {
                    driver.submit_search().await?;
                    driver.wait_for_result_view(timeout).await?;
                    driver.extract_record().await
                })
            })
            .await
            .map(|outcome| outcome.result)
    }

    /// Model selection with the escalation ladder, plus one full
    /// reset-and-reselect cycle before the failure verdict.
    async fn select_model(&mut self, brand: &str, model: &str, index: usize) -> DriverResult<()> {
        let retry = self.ctx.retry.clone();
        match select_in_list(
            self.driver.as_mut(),
            &retry,
            ChoiceList::Model,
            model,
            Some(index),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => {
                warn!(brand, model, error = %err, "model selection failed, reset-and-reselect cycle");
                self.driver.reset_search().await?;
                select_in_list(self.driver.as_mut(), &retry, ChoiceList::Brand, brand, None)
                    .await?;
                select_in_list(
                    self.driver.as_mut(),
                    &retry,
                    ChoiceList::Model,
                    model,
                    Some(index),
                )
                .await
            }
            Err(err) => Err(err),
        }
    }

    async fn reapply_selections(
        &mut self,
        brand: &str,
        model: &str,
        model_index: usize,
    ) -> DriverResult<()> {
        let retry = self.ctx.retry.clone();
        self.driver.reset_search().await?;
        select_in_list(self.driver.as_mut(), &retry, ChoiceList::Brand, brand, None).await?;
        select_in_list(
            self.driver.as_mut(),
            &retry,
            ChoiceList::Model,
            model,
            Some(model_index),
        )
        .await
    }
}

/// Label selection under the retry policy. Every attempt re-opens and
/// re-filters the list; the final attempt falls back to keyboard
/// navigation by index when one is known for the current enumeration.
async fn select_in_list(
    driver: &mut dyn UiDriver,
    retry: &RetryPolicy,
    list: ChoiceList,
    label: &str,
    index_fallback: Option<usize>,
) -> DriverResult<()> {
    let max_attempts = retry.max_attempts();
    let wanted = label.to_string();
    retry
        .run_with(&format!("select {list}"), driver, move |driver, attempt| {
            let wanted = wanted.clone();
            Box::pin(async move {
                match index_fallback {
                    Some(index) if max_attempts > 1 && attempt + 1 == max_attempts => {
                        driver.select_by_index(list, index).await
                    }
                    _ => driver.select_by_label(list, &wanted).await,
                }
            })
        })
        .await
        .map(|outcome| outcome.result)
}

fn truncate_to(limit: Option<usize>, labels: &mut Vec<String>) {
    if let Some(limit) = limit {
        labels.truncate(limit);
    }
}
