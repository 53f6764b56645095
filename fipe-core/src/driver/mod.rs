mod chosen;
mod error;
mod launcher;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::VehicleSegment;
use crate::sink::ExtractedRecord;

pub use chosen::{ChosenDriver, PortalSessionFactory};
pub use error::{DriverError, DriverResult};
pub use launcher::{BrowserLauncher, LaunchOverrides, PortalBrowser};

/// The four choice-lists of a consultation form, in the order the portal
/// requires them to be filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChoiceList {
    ReferenceMonth,
    Brand,
    Model,
    Year,
}

impl ChoiceList {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChoiceList::ReferenceMonth => "reference month",
            ChoiceList::Brand => "brand",
            ChoiceList::Model => "model",
            ChoiceList::Year => "year",
        }
    }
}

impl std::fmt::Display for ChoiceList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Element ids of one consultation form. The portal repeats the same
/// widget layout per segment with a suffix on every id, except the car
/// reference table which spells "Referencial" where the others have
/// "Referencia".
#[derive(Debug, Clone)]
pub struct SegmentSelectors {
    pub tab_label: &'static str,
    pub reference_list: &'static str,
    pub brand_list: &'static str,
    pub model_list: &'static str,
    pub year_list: &'static str,
    pub search_button: &'static str,
    pub clear_button: &'static str,
    pub result_table: &'static str,
}

impl SegmentSelectors {
    pub fn for_segment(segment: VehicleSegment) -> Self {
        match segment {
            VehicleSegment::Cars => Self {
                tab_label: "Carros e utilitários pequenos",
                reference_list: "selectTabelaReferencialcarro",
                brand_list: "selectMarcacarro",
                model_list: "selectAnoModelocarro",
                year_list: "selectAnocarro",
                search_button: "buttonPesquisarcarro",
                clear_button: "buttonLimparPesquisarcarro",
                result_table: "resultadoConsultacarroFiltros",
            },
            VehicleSegment::Motorcycles => Self {
                tab_label: "Motos",
                reference_list: "selectTabelaReferenciamoto",
                brand_list: "selectMarcamoto",
                model_list: "selectAnoModelomoto",
                year_list: "selectAnomoto",
                search_button: "buttonPesquisarmoto",
                clear_button: "buttonLimparPesquisarmoto",
                result_table: "resultadoConsultamotoFiltros",
            },
            VehicleSegment::Trucks => Self {
                tab_label: "Caminhões e Micro-Ônibus",
                reference_list: "selectTabelaReferenciacaminhao",
                brand_list: "selectMarcacaminhao",
                model_list: "selectAnoModelocaminhao",
                year_list: "selectAnocaminhao",
                search_button: "buttonPesquisarcaminhao",
                clear_button: "buttonLimparPesquisarcaminhao",
                result_table: "resultadoConsultacaminhaoFiltros",
            },
        }
    }

    pub fn list_id(&self, list: ChoiceList) -> &'static str {
        match list {
            ChoiceList::ReferenceMonth => self.reference_list,
            ChoiceList::Brand => self.brand_list,
            ChoiceList::Model => self.model_list,
            ChoiceList::Year => self.year_list,
        }
    }

    /// Chosen.js replaces each `<select>` with a container whose id is the
    /// select's id plus `_chosen`.
    pub fn chosen_container(&self, list: ChoiceList) -> String {
        format!("{}_chosen", self.list_id(list))
    }
}

/// Page-interaction contract consumed by the traversal engine. One
/// implementation drives the live portal; tests substitute scripted
/// stubs. Every operation may fail with a transient error and suspends
/// the calling worker until the UI settles.
#[async_trait]
pub trait UiDriver: Send {
    /// Select an option by visible text (exact, case-insensitive) and
    /// verify the widget echoes it back. A different echo is
    /// [`DriverError::SelectionMismatch`].
    async fn select_by_label(&mut self, list: ChoiceList, label: &str) -> DriverResult<()>;

    /// Fallback selection by position, navigating with the keyboard
    /// instead of text filtering. Valid only against the most recent
    /// enumeration of `list` in this session.
    async fn select_by_index(&mut self, list: ChoiceList, index: usize) -> DriverResult<()>;

    /// Freshly read the ordered option labels of `list`. Never cached:
    /// the portal can change item counts between opens.
    async fn enumerate_labels(&mut self, list: ChoiceList) -> DriverResult<Vec<String>>;

    async fn submit_search(&mut self) -> DriverResult<()>;

    async fn wait_for_result_view(&mut self, timeout: Duration) -> DriverResult<()>;

    async fn extract_record(&mut self) -> DriverResult<ExtractedRecord>;

    /// Clear the search form and wait until the brand widget shows its
    /// placeholder again. Submitting a search leaves stale selections
    /// behind, so the engine resets before re-selecting.
    async fn reset_search(&mut self) -> DriverResult<()>;
}
