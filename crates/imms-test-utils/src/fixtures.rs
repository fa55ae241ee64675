//! Pre-built fixtures for common test scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;

use imms_core::ScopedStorage;

use crate::storage::TracingMemoryBackend;

/// Submitter code used by the default fixtures.
pub const TEST_SUBMITTER_CODE: &str = "ABC12";

/// Submitter system the default code maps to.
pub const TEST_SUBMITTER_SYSTEM: &str = "EMIS";

/// Identifier system used by default rows.
pub const TEST_IDENTIFIER_URI: &str = "https://supplierABC/identifiers/vacc";

/// Test context with traced storage scoped to a throwaway environment.
pub struct TestContext {
    /// Shared traced backend.
    pub backend: Arc<TracingMemoryBackend>,
    /// Scoped view used by components.
    pub storage: ScopedStorage,
}

impl TestContext {
    /// Creates a new context in environment `test`.
    pub fn new() -> Self {
        let backend = Arc::new(TracingMemoryBackend::new());
        let storage = ScopedStorage::new(backend.clone(), "test").expect("valid environment");
        Self { backend, storage }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One bulk-file row with valid defaults for every column.
#[derive(Debug, Clone)]
pub struct RowFixture {
    values: BTreeMap<String, String>,
}

impl RowFixture {
    /// Creates a `NEW` row with the given `UNIQUE_ID`.
    pub fn new(unique_id: &str) -> Self {
        let defaults = [
            ("NHS_NUMBER", "9000000009"),
            ("PERSON_FORENAME", "JOHN"),
            ("PERSON_SURNAME", "DOE"),
            ("PERSON_DOB", "19800101"),
            ("PERSON_GENDER_CODE", "1"),
            ("PERSON_POSTCODE", "SW1A 1AA"),
            ("DATE_AND_TIME", "20240101T10000000"),
            ("SITE_CODE", "RVVKC"),
            ("SITE_CODE_TYPE_URI", "https://fhir.nhs.uk/Id/ods-organization-code"),
            ("UNIQUE_ID", unique_id),
            ("UNIQUE_ID_URI", TEST_IDENTIFIER_URI),
            ("ACTION_FLAG", "NEW"),
            ("PERFORMING_PROFESSIONAL_FORENAME", "ALICE"),
            ("PERFORMING_PROFESSIONAL_SURNAME", "SMITH"),
            ("RECORDED_DATE", "20240101"),
            ("PRIMARY_SOURCE", "TRUE"),
            ("VACCINATION_PROCEDURE_CODE", "1324681000000101"),
            (
                "VACCINATION_PROCEDURE_TERM",
                "Administration of first dose of SARS-CoV-2 vaccine",
            ),
            ("DOSE_SEQUENCE", "1"),
            ("VACCINE_PRODUCT_CODE", "39114911000001105"),
            ("VACCINE_PRODUCT_TERM", "COVID-19 Vaccine"),
            ("VACCINE_MANUFACTURER", "Pfizer"),
            ("BATCH_NUMBER", "AB1234"),
            ("EXPIRY_DATE", "20250101"),
            ("SITE_OF_VACCINATION_CODE", "368208006"),
            ("SITE_OF_VACCINATION_TERM", "Left upper arm structure"),
            ("ROUTE_OF_VACCINATION_CODE", "78421000"),
            ("ROUTE_OF_VACCINATION_TERM", "Intramuscular route"),
            ("DOSE_AMOUNT", "0.3"),
            ("DOSE_UNIT_CODE", "2622896019"),
            ("DOSE_UNIT_TERM", "Inhalation - unit of product usage"),
            ("INDICATION_CODE", "443684005"),
            ("LOCATION_CODE", "X99999"),
            ("LOCATION_CODE_TYPE_URI", "https://fhir.nhs.uk/Id/ods-organization-code"),
        ];
        Self {
            values: defaults
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    /// Sets `ACTION_FLAG`.
    #[must_use]
    pub fn action(self, flag: &str) -> Self {
        self.set("ACTION_FLAG", flag)
    }

    /// Sets any column.
    #[must_use]
    pub fn set(mut self, column: &str, value: impl Into<String>) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }

    /// Renders the row for the given header order; unknown columns render empty.
    pub fn to_line(&self, headers: &[&str]) -> String {
        headers
            .iter()
            .map(|h| self.values.get(*h).map_or("", String::as_str))
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// A bulk file under construction.
#[derive(Debug, Clone)]
pub struct BulkFileFixture {
    headers: Vec<String>,
    rows: Vec<RowFixture>,
}

impl BulkFileFixture {
    /// Starts a file with the given header row.
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| (*h).to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row.
    #[must_use]
    pub fn row(mut self, row: RowFixture) -> Self {
        self.rows.push(row);
        self
    }

    /// Renders header plus rows, newline separated.
    pub fn render(&self) -> String {
        let headers: Vec<&str> = self.headers.iter().map(String::as_str).collect();
        let mut out = headers.join("|");
        for row in &self.rows {
            out.push('\n');
            out.push_str(&row.to_line(&headers));
        }
        out.push('\n');
        out
    }
}

/// Builds a valid bulk file name for `category` and the default submitter code.
pub fn bulk_file_name(category: &str, timestamp: &str) -> String {
    format!("{category}_Vaccinations_v5_{TEST_SUBMITTER_CODE}_{timestamp}.csv")
}
