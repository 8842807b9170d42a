use thiserror::Error;

/// Failures reported by a rendering session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("timed out after {secs}s waiting for {what}")]
    RenderTimeout { what: String, secs: u64 },

    #[error("element not found: {selector}")]
    ElementNotFound { selector: String },

    #[error("navigation to {url} failed: {reason}")]
    NavigationFailed { url: String, reason: String },
}

impl RenderError {
    pub fn navigation(url: impl Into<String>, reason: impl ToString) -> Self {
        RenderError::NavigationFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Timeouts and navigation errors are worth another attempt; a missing
    /// element usually means the page layout changed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RenderError::RenderTimeout { .. } | RenderError::NavigationFailed { .. }
        )
    }
}

/// One product URL could not be turned into a document.
#[derive(Debug, Clone, Error)]
#[error("fetch failed for {url}: {source}")]
pub struct FetchError {
    pub url: String,
    #[source]
    pub source: RenderError,
}

/// Why a nutrition table produced no record. Never propagated as a failure.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ResolveMiss {
    #[error("nutrition table not found")]
    TableNotFound,
    #[error("no per-100g/100ml column in table header")]
    ColumnNotFound,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
}

impl SettingsError {
    pub fn invalid(field: &'static str, reason: impl ToString) -> Self {
        SettingsError::Invalid {
            field,
            reason: reason.to_string(),
        }
    }
}
