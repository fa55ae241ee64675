//! Environment-driven pipeline configuration.
//!
//! Every component receives a [`PipelineConfig`] at construction instead of reading
//! process state on its own. `from_env` is the only place variables are read.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::observability::LogFormat;

/// Submitters whose changes are never republished downstream by default.
pub const DEFAULT_EXCLUDED_SUBMITTERS: [&str; 2] = ["DPSFULL", "DPSREDUCED"];

/// Settings shared by the ingestion components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Storage scope name (`IMMS_ENVIRONMENT`).
    pub environment: String,
    /// Days a ledger entry is kept before it may expire (`IMMS_AUDIT_TTL_DAYS`).
    pub audit_ttl_days: u64,
    /// Days a delta entry is kept before it may expire (`IMMS_DELTA_TTL_DAYS`).
    pub delta_ttl_days: u64,
    /// Source label stamped on delta entries (`IMMS_DELTA_SOURCE`).
    pub delta_source: String,
    /// Submitter systems whose changes are skipped by the change feed
    /// (`IMMS_EXCLUDED_SUBMITTERS`, comma separated).
    pub excluded_submitters: Vec<String>,
    /// Bounded retries for read-modify-write loops on shared documents
    /// (`IMMS_MAX_CAS_RETRIES`).
    pub max_cas_retries: u32,
    /// Attempts at writing a delta entry before dead-lettering
    /// (`IMMS_DELTA_MAX_WRITE_ATTEMPTS`).
    pub delta_max_write_attempts: u32,
    /// Page size used when walking secondary indexes (`IMMS_INDEX_PAGE_SIZE`).
    pub index_page_size: usize,
    /// File-name submitter code to submitter system (`IMMS_SUBMITTER_CODES`,
    /// e.g. `ABC12=EMIS,XYZ99=TPP`).
    pub submitter_codes: BTreeMap<String, String>,
    /// Log output format (`IMMS_LOG_FORMAT`, `json` or `pretty`).
    pub log_format: LogFormat,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: "local".to_string(),
            audit_ttl_days: 30,
            delta_ttl_days: 30,
            delta_source: "IEDS".to_string(),
            excluded_submitters: DEFAULT_EXCLUDED_SUBMITTERS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            max_cas_retries: 5,
            delta_max_write_attempts: 3,
            index_page_size: 100,
            submitter_codes: BTreeMap::new(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` naming the offending variable if any value is
    /// malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` naming the offending variable if any value is
    /// malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(environment) = env.string("IMMS_ENVIRONMENT") {
            config.environment = environment;
        }
        if let Some(days) = env.u64("IMMS_AUDIT_TTL_DAYS")? {
            config.audit_ttl_days = days;
        }
        if let Some(days) = env.u64("IMMS_DELTA_TTL_DAYS")? {
            config.delta_ttl_days = days;
        }
        if let Some(source) = env.string("IMMS_DELTA_SOURCE") {
            config.delta_source = source;
        }
        if let Some(list) = env.string("IMMS_EXCLUDED_SUBMITTERS") {
            config.excluded_submitters = parse_list(&list);
        }
        if let Some(retries) = env.u32("IMMS_MAX_CAS_RETRIES")? {
            config.max_cas_retries = retries;
        }
        if let Some(attempts) = env.u32("IMMS_DELTA_MAX_WRITE_ATTEMPTS")? {
            if attempts == 0 {
                return Err(Error::InvalidInput(
                    "IMMS_DELTA_MAX_WRITE_ATTEMPTS must be at least 1".to_string(),
                ));
            }
            config.delta_max_write_attempts = attempts;
        }
        if let Some(size) = env.u64("IMMS_INDEX_PAGE_SIZE")? {
            config.index_page_size = usize::try_from(size.max(1)).unwrap_or(usize::MAX);
        }
        if let Some(codes) = env.string("IMMS_SUBMITTER_CODES") {
            config.submitter_codes = parse_submitter_codes("IMMS_SUBMITTER_CODES", &codes)?;
        }
        if let Some(format) = env.string("IMMS_LOG_FORMAT") {
            config.log_format = parse_log_format("IMMS_LOG_FORMAT", &format)?;
        }

        Ok(config)
    }

    /// Sets the storage environment.
    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Registers a file-name submitter code.
    #[must_use]
    pub fn with_submitter_code(
        mut self,
        code: impl Into<String>,
        system: impl Into<String>,
    ) -> Self {
        self.submitter_codes
            .insert(code.into().to_ascii_uppercase(), system.into());
        self
    }

    /// Replaces the excluded submitter set.
    #[must_use]
    pub fn with_excluded_submitters<I, S>(mut self, submitters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_submitters = submitters.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the delta write attempt bound.
    #[must_use]
    pub fn with_delta_max_write_attempts(mut self, attempts: u32) -> Self {
        self.delta_max_write_attempts = attempts.max(1);
        self
    }

    /// Sets the index page size.
    #[must_use]
    pub fn with_index_page_size(mut self, size: usize) -> Self {
        self.index_page_size = size.max(1);
        self
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_submitter_codes(name: &str, value: &str) -> Result<BTreeMap<String, String>> {
    let mut codes = BTreeMap::new();
    for pair in parse_list(value) {
        let Some((code, system)) = pair.split_once('=') else {
            return Err(Error::InvalidInput(format!(
                "{name} entries must look like CODE=SYSTEM (got {pair})"
            )));
        };
        let (code, system) = (code.trim(), system.trim());
        if code.is_empty() || system.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{name} entries must look like CODE=SYSTEM (got {pair})"
            )));
        }
        codes.insert(code.to_ascii_uppercase(), system.to_string());
    }
    Ok(codes)
}

fn parse_log_format(name: &str, value: &str) -> Result<LogFormat> {
    match value.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be one of: json, pretty (got {value})"
        ))),
    }
}
