//! Bulk file names.
//!
//! `{CATEGORY}_Vaccinations_v{N}_{SUBMITTER-CODE}_{TIMESTAMP}.{csv|dat}`, compared
//! case-insensitively. Only version `V5` is accepted.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{BatchError, Result};

/// Vaccine categories accepted in file names.
pub const KNOWN_CATEGORIES: [&str; 12] = [
    "COVID", "COVID19", "FLU", "HPV", "MMR", "MMRV", "RSV", "PERTUSSIS", "SHINGLES", "PCV13",
    "3IN1", "MENACWY",
];

/// The only accepted file format version.
pub const SUPPORTED_VERSION: &str = "V5";

/// Format of `created_at` in acknowledgment names and `RECEIVED_TIME`.
pub const CREATED_AT_FORMAT: &str = "%Y%m%dT%H%M%S00";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// A validated bulk file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileKey {
    raw: String,
    category: String,
    submitter_code: String,
    timestamp: NaiveDateTime,
    extension: String,
}

impl FileKey {
    /// Parses and validates a file name.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidFileKey`] describing the first rule the name breaks.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| BatchError::invalid_file_key(raw, reason);

        if raw.contains('/') || raw.contains('\\') {
            return Err(invalid("file key must not contain directory separators"));
        }
        let upper = raw.to_ascii_uppercase();
        let (stem, extension) = upper
            .rsplit_once('.')
            .ok_or_else(|| invalid("missing file extension"))?;
        if extension != "CSV" && extension != "DAT" {
            return Err(invalid("extension must be .csv or .dat"));
        }

        let parts: Vec<&str> = stem.split('_').collect();
        let [category, marker, version, code, timestamp] = parts.as_slice() else {
            return Err(invalid("expected five underscore-separated parts"));
        };
        if !KNOWN_CATEGORIES.contains(category) {
            return Err(invalid("unknown vaccine category"));
        }
        if *marker != "VACCINATIONS" {
            return Err(invalid("second part must be Vaccinations"));
        }
        if *version != SUPPORTED_VERSION {
            return Err(invalid("unsupported file version"));
        }
        if code.is_empty() {
            return Err(invalid("missing submitter code"));
        }
        let timestamp = parse_timestamp(timestamp).ok_or_else(|| invalid("invalid timestamp"))?;

        Ok(Self {
            raw: raw.to_string(),
            category: (*category).to_string(),
            submitter_code: (*code).to_string(),
            timestamp,
            extension: extension.to_string(),
        })
    }

    /// The name as received.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Uppercase vaccine category.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Uppercase submitter code (an organisation code, not the submitter system).
    #[must_use]
    pub fn submitter_code(&self) -> &str {
        &self.submitter_code
    }

    /// Timestamp embedded in the name.
    #[must_use]
    pub const fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// Uppercase extension without the dot.
    #[must_use]
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// The name without its extension, as received.
    #[must_use]
    pub fn stem(&self) -> &str {
        file_stem(&self.raw)
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Serialization key for a submitter and category: `{submitter}_{category}`.
#[must_use]
pub fn queue_key(submitter: &str, category: &str) -> String {
    format!("{submitter}_{}", category.to_ascii_uppercase())
}

/// Formats a creation time the way acknowledgments carry it.
#[must_use]
pub fn format_created_at(created_at: DateTime<Utc>) -> String {
    created_at.format(CREATED_AT_FORMAT).to_string()
}

/// Strips the extension from a file name, if it has one.
#[must_use]
pub fn file_stem(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

// `YYYYMMDDTHHMMSS`, optionally followed by a zone offset of `00` or `01`.
fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let base = match value.len() {
        15 => value,
        17 => {
            let (base, offset) = value.split_at(15);
            if offset != "00" && offset != "01" {
                return None;
            }
            base
        }
        _ => return None,
    };
    NaiveDateTime::parse_from_str(base, TIMESTAMP_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_valid_names() {
        let key = FileKey::parse("COVID_Vaccinations_v5_ABC12_20240101T120000.csv").unwrap();
        assert_eq!(key.category(), "COVID");
        assert_eq!(key.submitter_code(), "ABC12");
        assert_eq!(key.extension(), "CSV");
        assert_eq!(key.stem(), "COVID_Vaccinations_v5_ABC12_20240101T120000");

        let key = FileKey::parse("flu_vaccinations_V5_xyz99_20240101T12000001.DAT").unwrap();
        assert_eq!(key.category(), "FLU");
        assert_eq!(key.submitter_code(), "XYZ99");
    }

    #[test]
    fn rejects_malformed_names() {
        let cases = [
            "COVID_Vaccinations_v5_ABC12_20240101T120000.txt",
            "COVID_Vaccinations_v4_ABC12_20240101T120000.csv",
            "POLIO_Vaccinations_v5_ABC12_20240101T120000.csv",
            "COVID_Vaccines_v5_ABC12_20240101T120000.csv",
            "COVID_Vaccinations_v5_ABC12.csv",
            "COVID_Vaccinations_v5_ABC12_20240101T120000_extra.csv",
            "COVID_Vaccinations_v5_ABC12_20241301T120000.csv",
            "COVID_Vaccinations_v5_ABC12_20240101T12000002.csv",
            "COVID_Vaccinations_v5_ABC12_2024010T120000.csv",
            "dir/COVID_Vaccinations_v5_ABC12_20240101T120000.csv",
            "COVID_Vaccinations_v5_ABC12_20240101T120000",
        ];
        for case in cases {
            assert!(
                matches!(FileKey::parse(case), Err(BatchError::InvalidFileKey { .. })),
                "{case} should be rejected"
            );
        }
    }

    #[test]
    fn derives_queue_key_and_created_at() {
        assert_eq!(queue_key("EMIS", "covid"), "EMIS_COVID");
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(format_created_at(at), "20240101T12000000");
        assert_eq!(file_stem("a.b.csv"), "a.b");
        assert_eq!(file_stem("plain"), "plain");
    }
}
