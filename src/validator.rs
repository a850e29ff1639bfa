//! Per-record and per-batch data-quality validation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::models::{CensusRecord, GeographyLevel, Value};

/// Matches a Census API variable code such as `B01003_001E` or `DP05_0001PE`.
static VARIABLE_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{1,4}[0-9]{5}(_[0-9]{3,4}[A-Z]{0,2})?$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub issue_type: String,
    pub severity: IssueSeverity,
    pub count: u32,
    pub sample: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchQualityReport {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub issues: Vec<ValidationIssue>,
}

impl BatchQualityReport {
    pub fn passes(&self, config: &Config) -> bool {
        let thresholds = &config.quality_thresholds;
        let meets_thresholds = self.completeness >= thresholds.completeness
            && self.accuracy >= thresholds.accuracy
            && self.consistency >= thresholds.consistency;

        if config.strict_validation {
            meets_thresholds && !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
        } else {
            meets_thresholds
        }
    }
}

/// Expected digit length of a geography code at a given level.
fn expected_code_length(level: GeographyLevel) -> Option<usize> {
    match level {
        GeographyLevel::State => Some(2),
        GeographyLevel::County => Some(5),
        GeographyLevel::Zcta => Some(5),
        GeographyLevel::Tract => Some(11),
        GeographyLevel::BlockGroup => Some(12),
        GeographyLevel::Nation | GeographyLevel::Metro | GeographyLevel::Place => None,
    }
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Per-record structural and plausibility checks. Returns `Ok(())` when the
/// record passes every check, or `Err(issue_type)` naming the first failure.
pub fn validate_record(record: &CensusRecord) -> Result<(), &'static str> {
    if record.geography_code.is_empty() || record.dataset.is_empty() || record.variable_name.is_empty() {
        return Err("missing_required_field");
    }

    if let Some(expected_len) = expected_code_length(record.geography_level) {
        if record.geography_code.len() != expected_len || !is_all_digits(&record.geography_code) {
            return Err("geography_code_format");
        }
    }

    if !VARIABLE_NAME_PATTERN.is_match(&record.variable_name) {
        return Err("variable_name_format");
    }

    if !plausible(&record.variable_name, &record.variable_value) {
        return Err("implausible_value");
    }

    if let (Some(state_code), Some(county_code)) = (&record.state_code, &record.county_code) {
        if record.geography_level == GeographyLevel::County && !record.geography_code.starts_with(state_code.as_str()) {
            return Err("referential_mismatch");
        }
        let _ = county_code;
    }

    Ok(())
}

fn plausible(variable_name: &str, value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Int64(i) => {
            if variable_name.starts_with("B01003") {
                *i >= 0
            } else {
                true
            }
        }
        Value::Float64(f) => {
            if variable_name.ends_with("_PCT") {
                (0.0..=100.0).contains(f)
            } else if variable_name.starts_with("B01003") {
                *f >= 0.0
            } else {
                f.is_finite()
            }
        }
        Value::Text(_) => true,
    }
}

/// Scores a whole batch and collects issues. Required fields considered:
/// `geography_level`, `geography_code`, `dataset`, `year`, `variable_name`.
pub fn validate_batch(records: &[CensusRecord]) -> BatchQualityReport {
    if records.is_empty() {
        return BatchQualityReport { completeness: 1.0, accuracy: 1.0, consistency: 1.0, issues: Vec::new() };
    }

    let total = records.len() as f64;
    let mut non_null_required = 0u32;
    let mut passing = 0u32;
    let mut coherent_parent = 0u32;
    let mut error_counts: std::collections::HashMap<&'static str, (u32, Option<String>)> = std::collections::HashMap::new();

    for record in records {
        let required_present = !record.geography_code.is_empty()
            && !record.dataset.is_empty()
            && !record.variable_name.is_empty()
            && record.year > 0;
        if required_present {
            non_null_required += 1;
        }

        match validate_record(record) {
            Ok(()) => passing += 1,
            Err(issue_type) => {
                let entry = error_counts.entry(issue_type).or_insert((0, None));
                entry.0 += 1;
                if entry.1.is_none() {
                    entry.1 = Some(record.geography_code.clone());
                }
            }
        }

        let parent_coherent = match (&record.state_code, &record.county_code) {
            (Some(state_code), Some(_)) => record.geography_code.starts_with(state_code.as_str()),
            _ => true,
        };
        if parent_coherent {
            coherent_parent += 1;
        }
    }

    let issues = error_counts
        .into_iter()
        .map(|(issue_type, (count, sample))| ValidationIssue {
            issue_type: issue_type.to_string(),
            severity: IssueSeverity::Error,
            count,
            sample,
        })
        .collect();

    BatchQualityReport {
        completeness: non_null_required as f64 / total,
        accuracy: passing as f64 / total,
        consistency: coherent_parent as f64 / total,
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(value: Value) -> CensusRecord {
        CensusRecord {
            dataset: "acs5".to_string(),
            year: 2023,
            geography_level: GeographyLevel::State,
            geography_code: "06".to_string(),
            geography_name: Some("California".to_string()),
            state_code: Some("06".to_string()),
            county_code: None,
            tract_code: None,
            block_group_code: None,
            zip_code: None,
            variable_name: "B01003_001E".to_string(),
            variable_value: value,
            margin_of_error: None,
        }
    }

    #[test]
    fn negative_population_is_rejected() {
        let record = sample_record(Value::Int64(-5));
        assert_eq!(validate_record(&record), Err("implausible_value"));
    }

    #[test]
    fn well_formed_record_passes() {
        let record = sample_record(Value::Int64(39_000_000));
        assert_eq!(validate_record(&record), Ok(()));
    }

    #[test]
    fn lowercase_variable_name_is_rejected() {
        let mut record = sample_record(Value::Int64(1));
        record.variable_name = "b01003_001e".to_string();
        assert_eq!(validate_record(&record), Err("variable_name_format"));
    }

    #[test]
    fn malformed_state_code_is_rejected() {
        let mut record = sample_record(Value::Int64(1));
        record.geography_code = "1".to_string();
        assert_eq!(validate_record(&record), Err("geography_code_format"));
    }

    #[test]
    fn strict_mode_fails_batch_on_any_error_issue() {
        let mut config = Config::default();
        config.strict_validation = true;
        let report = BatchQualityReport {
            completeness: 1.0,
            accuracy: 1.0,
            consistency: 1.0,
            issues: vec![ValidationIssue {
                issue_type: "implausible_value".to_string(),
                severity: IssueSeverity::Error,
                count: 1,
                sample: None,
            }],
        };
        assert!(!report.passes(&config));
    }

    #[test]
    fn empty_batch_passes_trivially() {
        let report = validate_batch(&[]);
        assert_eq!(report.completeness, 1.0);
    }
}
