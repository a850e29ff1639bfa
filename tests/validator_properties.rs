use census_ingest::config::Config;
use census_ingest::models::{CensusRecord, GeographyLevel, Value};
use census_ingest::validator::{validate_batch, validate_record, IssueSeverity};
use proptest::prelude::*;

fn record_with_population(pop: i64) -> CensusRecord {
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
        variable_value: Value::Int64(pop),
        margin_of_error: None,
    }
}

proptest! {
    /// For every successful response, records_loaded + records_skipped +
    /// records_errored == records_received.
    #[test]
    fn population_values_partition_pass_fail(pops in prop::collection::vec(-1000i64..1_000_000, 1..50)) {
        let records: Vec<CensusRecord> = pops.iter().map(|p| record_with_population(*p)).collect();
        let passing = records.iter().filter(|r| validate_record(r).is_ok()).count();
        let failing = records.len() - passing;
        let negatives = pops.iter().filter(|p| **p < 0).count();
        prop_assert_eq!(failing, negatives);
        prop_assert_eq!(passing + failing, records.len());
    }
}

/// Strict validation rejection: a negative population fails the batch
/// under strict mode and is reported as an error-severity issue.
#[test]
fn strict_mode_rejects_batch_with_negative_population() {
    let mut config = Config::default();
    config.strict_validation = true;

    let records = vec![record_with_population(100), record_with_population(-5)];
    let report = validate_batch(&records);

    assert!(!report.passes(&config));
    assert!(report.issues.iter().any(|i| i.severity == IssueSeverity::Error));
}

#[test]
fn empty_response_yields_records_skipped_not_error() {
    let report = validate_batch(&[]);
    assert_eq!(report.completeness, 1.0);
    assert!(report.issues.is_empty());
}

#[test]
fn geography_code_format_enforced_for_state_level() {
    let mut record = record_with_population(100);
    record.geography_code = "6".to_string();
    assert!(validate_record(&record).is_err());
}
