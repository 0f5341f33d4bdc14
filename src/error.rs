//! Crate-wide error type.
//!
//! Setup failures (bad settings, malformed IRF, empty data, re-entrant run)
//! are reported eagerly with a distinct code so callers can branch on the
//! failure class without string matching. Numerical trouble inside a single
//! fit is *not* an error: the affected region is marked unconverged and the
//! run continues.

/// Invalid configuration value or model composition.
pub const CODE_CONFIG: i32 = 2;
/// Missing or empty input data (no regions, no pixels).
pub const CODE_DATA: i32 = 3;
/// Numerical failure during setup (not during a fit).
pub const CODE_NUMERIC: i32 = 4;
/// Instrument response function rejected (normalisation, shape).
pub const CODE_IRF: i32 = 5;
/// A fit is already running on this controller.
pub const CODE_FIT_IN_PROGRESS: i32 = 6;
/// Operation requires `init()` to have been called first.
pub const CODE_NOT_INITIALISED: i32 = 7;

#[derive(Clone)]
pub struct FitError {
    code: i32,
    message: String,
}

impl FitError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(CODE_CONFIG, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(CODE_DATA, message)
    }

    pub fn numeric(message: impl Into<String>) -> Self {
        Self::new(CODE_NUMERIC, message)
    }

    pub fn irf(message: impl Into<String>) -> Self {
        Self::new(CODE_IRF, message)
    }

    pub fn fit_in_progress() -> Self {
        Self::new(CODE_FIT_IN_PROGRESS, "Fit already in progress.")
    }

    pub fn not_initialised() -> Self {
        Self::new(CODE_NOT_INITIALISED, "Controller has not been initialised.")
    }

    pub fn code(&self) -> i32 {
        self.code
    }
}

impl std::fmt::Display for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitError")
            .field("code", &self.code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for FitError {}
