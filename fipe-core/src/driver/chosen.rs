use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::PortalSection;
use crate::retry::Pacer;
use crate::sink::ExtractedRecord;

use super::error::{DriverError, DriverResult};
use super::launcher::PortalBrowser;
use super::{ChoiceList, SegmentSelectors, UiDriver};

const POLL_INTERVAL: Duration = Duration::from_millis(150);

/// How many highlight transitions the keyboard rewind tolerates before
/// assuming the first option is reached. Bounds a dropdown whose
/// highlight never stabilizes.
const MAX_REWIND_STEPS: usize = 40;

/// Driver for the portal's Chosen.js dropdown widgets over one CDP page.
///
/// Chosen replaces each `<select>` with a container div; options only
/// exist in the DOM while the container is open, and the visible `li` set
/// changes when the filter input is used. Every operation therefore
/// re-opens the container instead of trusting previously seen nodes.
pub struct ChosenDriver {
    page: Page,
    portal: PortalSection,
    selectors: SegmentSelectors,
    pacer: Pacer,
}

impl ChosenDriver {
    pub fn new(page: Page, portal: PortalSection, pacer: Pacer) -> Self {
        let selectors = SegmentSelectors::for_segment(portal.segment);
        Self {
            page,
            portal,
            selectors,
            pacer,
        }
    }

    /// Navigate to the portal, open the segment's consultation form and
    /// pick the current reference month, leaving the form ready for a
    /// brand selection.
    pub async fn prepare(&mut self) -> DriverResult<()> {
        info!(url = %self.portal.base_url, segment = %self.portal.segment, "opening portal session");
        self.page
            .goto(self.portal.base_url.as_str())
            .await
            .map_err(|err| DriverError::Navigation(err.to_string()))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|err| DriverError::Navigation(err.to_string()))?;

        let tab_visible = format!(
            r#"(() => Array.from(document.querySelectorAll('li'))
                .some(el => el.textContent.includes({label})))()"#,
            label = js_string(self.selectors.tab_label),
        );
        self.wait_until(
            &tab_visible,
            "portal landing page",
            Duration::from_secs(self.portal.navigation_timeout_secs),
        )
        .await?;

        self.click_segment_tab().await?;
        self.wait_for_selector(
            &format!(
                "div.chosen-container#{}",
                self.selectors.chosen_container(ChoiceList::ReferenceMonth)
            ),
            "consultation form",
            self.dropdown_timeout(),
        )
        .await?;

        // First entry of the reference table is the current month.
        self.select_by_index(ChoiceList::ReferenceMonth, 0).await?;
        Ok(())
    }

    fn dropdown_timeout(&self) -> Duration {
        Duration::from_secs(self.portal.dropdown_timeout_secs)
    }

    async fn click_segment_tab(&self) -> DriverResult<()> {
        let script = format!(
            r#"(() => {{
                const items = Array.from(document.querySelectorAll('li'));
                const target = items.find(el => el.textContent.includes({label}));
                if (!target) return false;
                target.click();
                return true;
            }})()"#,
            label = js_string(self.selectors.tab_label),
        );
        let clicked: bool = self.eval(&script).await?;
        if !clicked {
            return Err(DriverError::ElementNotFound(format!(
                "segment tab {:?}",
                self.selectors.tab_label
            )));
        }
        Ok(())
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> DriverResult<T> {
        self.page
            .evaluate(script)
            .await?
            .into_value()
            .map_err(|err| DriverError::Evaluation(err.to_string()))
    }

    async fn find(&self, selector: &str, what: &str) -> DriverResult<Element> {
        self.page
            .find_element(selector)
            .await
            .map_err(|_| DriverError::ElementNotFound(format!("{what} ({selector})")))
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        what: &str,
        timeout: Duration,
    ) -> DriverResult<()> {
        let script = format!(
            "(() => document.querySelector({sel}) !== null)()",
            sel = js_string(selector),
        );
        self.wait_until(&script, what, timeout).await
    }

    async fn wait_until(&self, script: &str, what: &str, timeout: Duration) -> DriverResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.eval::<bool>(script).await.unwrap_or(false) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(what.to_string()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    fn anchor_selector(&self, list: ChoiceList) -> String {
        format!(
            "div.chosen-container#{} > a",
            self.selectors.chosen_container(list)
        )
    }

    fn results_selector(&self, list: ChoiceList) -> String {
        format!(
            "div.chosen-container#{} ul.chosen-results > li",
            self.selectors.chosen_container(list)
        )
    }

    /// Click the container anchor and wait until option `li`s are
    /// attached. Chosen loads options lazily, so an empty results list
    /// right after the click is normal.
    async fn open_dropdown(&self, list: ChoiceList) -> DriverResult<()> {
        self.pacer.between_interactions().await;
        let anchor = self
            .find(&self.anchor_selector(list), &format!("{list} dropdown"))
            .await?;
        anchor.click().await?;
        let script = format!(
            "(() => document.querySelectorAll({sel}).length > 0)()",
            sel = js_string(&self.results_selector(list)),
        );
        self.wait_until(&script, &format!("{list} options"), self.dropdown_timeout())
            .await
    }

    async fn close_dropdowns(&self) -> DriverResult<()> {
        if let Ok(body) = self.page.find_element("body").await {
            let _ = body.press_key("Escape").await;
        }
        let _: bool = self
            .eval("(() => { if (document.activeElement) document.activeElement.blur(); return true; })()")
            .await?;
        Ok(())
    }

    async fn read_labels(&self, list: ChoiceList) -> DriverResult<Vec<String>> {
        let script = format!(
            r#"(() => Array.from(document.querySelectorAll({sel}))
                .map(el => el.textContent.trim())
                .filter(text => text.length > 0))()"#,
            sel = js_string(&self.results_selector(list)),
        );
        self.eval(&script).await
    }

    /// Visible text currently echoed by the widget's closed face.
    async fn echo_text(&self, list: ChoiceList) -> DriverResult<String> {
        let script = format!(
            r#"(() => {{
                const span = document.querySelector({sel});
                return span ? span.textContent.trim() : '';
            }})()"#,
            sel = js_string(&format!("{} span", self.anchor_selector(list))),
        );
        self.eval(&script).await
    }

    async fn type_into_filter(&self, list: ChoiceList, text: &str) -> DriverResult<bool> {
        let selector = format!(
            "div.chosen-container#{} .chosen-search input",
            self.selectors.chosen_container(list)
        );
        match self.page.find_element(selector.as_str()).await {
            Ok(input) => {
                input.click().await?;
                input.type_str(text).await?;
                self.pacer.between_interactions().await;
                Ok(true)
            }
            // Single-select widgets without a search box filter nothing;
            // the caller falls back to scanning the full option list.
            Err(_) => Ok(false),
        }
    }

    async fn click_option_matching(&self, list: ChoiceList, label: &str) -> DriverResult<()> {
        let script = format!(
            r#"(() => {{
                const wanted = {label}.trim().toLowerCase();
                const items = Array.from(document.querySelectorAll({sel}));
                return items.findIndex(el => el.textContent.trim().toLowerCase() === wanted);
            }})()"#,
            label = js_string(label),
            sel = js_string(&self.results_selector(list)),
        );
        let index: i64 = self.eval(&script).await?;
        if index < 0 {
            return Err(DriverError::ElementNotFound(format!(
                "{list} option {label:?}"
            )));
        }
        let option_selector = format!(
            "{}:nth-child({})",
            self.results_selector(list),
            index + 1
        );
        let option = self
            .find(&option_selector, &format!("{list} option {label:?}"))
            .await?;
        option.scroll_into_view().await?;
        option.click().await?;
        Ok(())
    }

    async fn verify_echo(&self, list: ChoiceList, label: &str) -> DriverResult<()> {
        self.pacer.between_interactions().await;
        let echoed = self.echo_text(list).await?;
        if echoed.to_lowercase().contains(&label.trim().to_lowercase()) {
            Ok(())
        } else {
            Err(DriverError::SelectionMismatch {
                requested: label.to_string(),
                echoed,
            })
        }
    }

    async fn highlighted_text(&self, list: ChoiceList) -> DriverResult<String> {
        let script = format!(
            r#"(() => {{
                const item = document.querySelector({sel});
                return item ? item.textContent.trim() : '';
            }})()"#,
            sel = js_string(&format!(
                "div.chosen-container#{} ul.chosen-results > li.highlighted",
                self.selectors.chosen_container(list)
            )),
        );
        self.eval(&script).await
    }
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

#[async_trait]
impl UiDriver for ChosenDriver {
    async fn select_by_label(&mut self, list: ChoiceList, label: &str) -> DriverResult<()> {
        debug!(list = %list, label, "selecting option by label");
        self.open_dropdown(list).await?;
        let filtered = self.type_into_filter(list, label).await?;
        if let Err(err) = self.click_option_matching(list, label).await {
            if filtered {
                // The filter can hide an option whose text has extra
                // whitespace; re-open unfiltered and scan everything.
                self.close_dropdowns().await?;
                self.open_dropdown(list).await?;
                self.click_option_matching(list, label).await?;
            } else {
                return Err(err);
            }
        }
        self.verify_echo(list, label).await
    }

    async fn select_by_index(&mut self, list: ChoiceList, index: usize) -> DriverResult<()> {
        debug!(list = %list, index, "selecting option by keyboard index");
        self.close_dropdowns().await?;
        self.open_dropdown(list).await?;
        let anchor = self
            .find(&self.anchor_selector(list), &format!("{list} dropdown"))
            .await?;
        anchor.focus().await?;

        // Rewind to the top: keep pressing ArrowUp until the highlighted
        // option stops changing.
        let mut last_seen = String::new();
        for _ in 0..MAX_REWIND_STEPS {
            let current = self.highlighted_text(list).await?;
            if !current.is_empty() && current == last_seen {
                break;
            }
            last_seen = current;
            anchor.press_key("ArrowUp").await?;
            sleep(Duration::from_millis(50)).await;
        }

        for _ in 0..index {
            anchor.press_key("ArrowDown").await?;
            sleep(Duration::from_millis(50)).await;
        }
        anchor.press_key("Enter").await?;
        self.pacer.between_interactions().await;
        Ok(())
    }

    async fn enumerate_labels(&mut self, list: ChoiceList) -> DriverResult<Vec<String>> {
        self.open_dropdown(list).await?;
        let labels = self.read_labels(list).await?;
        self.close_dropdowns().await?;
        debug!(list = %list, count = labels.len(), "enumerated options");
        Ok(labels)
    }

    async fn submit_search(&mut self) -> DriverResult<()> {
        self.pacer.between_interactions().await;
        let selector = format!("#{}", self.selectors.search_button);
        let button = self.find(&selector, "search button").await?;
        button.scroll_into_view().await?;
        button.click().await?;
        Ok(())
    }

    async fn wait_for_result_view(&mut self, timeout: Duration) -> DriverResult<()> {
        let script = format!(
            r#"(() => {{
                const table = document.querySelector({sel});
                return !!table && table.querySelectorAll('tr').length > 0;
            }})()"#,
            sel = js_string(&format!("#{}", self.selectors.result_table)),
        );
        self.wait_until(&script, "result view", timeout).await
    }

    async fn extract_record(&mut self) -> DriverResult<ExtractedRecord> {
        let script = format!(
            r#"(() => {{
                const table = document.querySelector({sel});
                if (!table) return null;
                const data = {{}};
                let lastLabel = null;
                for (const row of table.querySelectorAll('tr')) {{
                    const cells = row.querySelectorAll('td');
                    if (cells.length === 2) {{
                        const labelEl = cells[0].querySelector('p, strong') || cells[0];
                        const valueEl = cells[1].querySelector('p, strong') || cells[1];
                        const label = labelEl.textContent.trim();
                        const value = valueEl.textContent.trim();
                        if (label) {{ data[label] = value; lastLabel = label; }}
                    }} else if (cells.length === 1 && lastLabel
                            && (cells[0].className || '').includes('noborder')) {{
                        const valueEl = cells[0].querySelector('p, strong') || cells[0];
                        data[lastLabel] = valueEl.textContent.trim();
                    }}
                }}
                return data;
            }})()"#,
            sel = js_string(&format!("#{}", self.selectors.result_table)),
        );
        let raw: Option<BTreeMap<String, String>> = self.eval(&script).await?;
        let raw = raw.ok_or_else(|| DriverError::ElementNotFound("result table".to_string()))?;

        // The portal renders knockout templates into hidden rows; their
        // `{{ ... }}` placeholders must not reach the sink.
        let record: ExtractedRecord = raw
            .into_iter()
            .filter(|(label, value)| {
                !label.starts_with('{') && !value.starts_with('{') && !value.is_empty()
            })
            .collect();
        if record.is_empty() {
            return Err(DriverError::Evaluation(
                "result table yielded no labeled rows".to_string(),
            ));
        }
        Ok(record)
    }

    async fn reset_search(&mut self) -> DriverResult<()> {
        self.pacer.between_interactions().await;
        let selector = format!("#{} a", self.selectors.clear_button);
        let link = match self.page.find_element(selector.as_str()).await {
            Ok(link) => link,
            Err(_) => {
                self.find(&format!("#{}", self.selectors.clear_button), "clear button")
                    .await?
            }
        };
        link.scroll_into_view().await?;
        link.click().await?;

        // The form is only usable again once the brand widget is back to
        // its placeholder.
        let script = format!(
            r#"(() => {{
                const span = document.querySelector({sel});
                return !!span && span.textContent.toLowerCase().includes('selecione');
            }})()"#,
            sel = js_string(&format!("{} span", self.anchor_selector(ChoiceList::Brand))),
        );
        self.wait_until(&script, "search reset", self.dropdown_timeout())
            .await
    }
}

/// Creates one isolated portal session per worker: a fresh page on the
/// shared browser, navigated and positioned on the segment's form.
pub struct PortalSessionFactory {
    browser: Arc<PortalBrowser>,
    portal: PortalSection,
    pacer: Pacer,
}

impl PortalSessionFactory {
    pub fn new(browser: Arc<PortalBrowser>, portal: PortalSection, pacer: Pacer) -> Self {
        Self {
            browser,
            portal,
            pacer,
        }
    }

    pub async fn open_session(&self) -> DriverResult<ChosenDriver> {
        let page = self.browser.new_page().await?;
        let mut driver = ChosenDriver::new(page, self.portal.clone(), self.pacer.clone());
        if let Err(err) = driver.prepare().await {
            warn!(error = %err, "portal session bootstrap failed");
            return Err(err);
        }
        Ok(driver)
    }
}
