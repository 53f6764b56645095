use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("selection echoed {echoed:?}, wanted {requested:?}")]
    SelectionMismatch { requested: String, echoed: String },
    #[error("script evaluation failed: {0}")]
    Evaluation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl DriverError {
    /// Whether the retry policy should attempt the operation again.
    /// Selection mismatches and wait expiries recover often; a failed
    /// launch or navigation will not get better by repeating the call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout(_)
                | DriverError::ElementNotFound(_)
                | DriverError::SelectionMismatch { .. }
                | DriverError::Evaluation(_)
        )
    }
}
