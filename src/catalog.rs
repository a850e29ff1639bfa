//! Static tables of geography/variable priorities and the ordered phase
//! catalog (`foundation`, `expansion`, `comprehensive`, `detailed`).

use chrono::{DateTime, Utc};

use crate::models::GeographyLevel;

#[derive(Debug, Clone, Copy)]
pub struct VariablePriority {
    pub weight: u8,
    pub category: &'static str,
    pub description: &'static str,
}

pub fn variable_priority(code: &str) -> VariablePriority {
    match code {
        "B01003_001E" => VariablePriority { weight: 100, category: "population", description: "Total population" },
        "B19013_001E" => VariablePriority { weight: 90, category: "income", description: "Median household income" },
        "B25077_001E" => VariablePriority { weight: 70, category: "housing", description: "Median home value" },
        "B15003_022E" => VariablePriority { weight: 60, category: "education", description: "Bachelor's degree attainment" },
        "B08301_001E" => VariablePriority { weight: 40, category: "commute", description: "Means of transportation to work" },
        _ => VariablePriority { weight: 20, category: "other", description: "Unclassified variable" },
    }
}

pub fn geography_priority(level: GeographyLevel) -> u8 {
    match level {
        GeographyLevel::Nation => 100,
        GeographyLevel::State => 90,
        GeographyLevel::Metro => 70,
        GeographyLevel::County => 60,
        GeographyLevel::Place => 40,
        GeographyLevel::Zcta => 35,
        GeographyLevel::Tract => 20,
        GeographyLevel::BlockGroup => 10,
    }
}

/// Fixed record-count estimate for a geography level, nationwide and
/// unfiltered. Callers clamp this by any supplied filter cardinality.
pub fn estimated_record_count(level: GeographyLevel) -> u64 {
    match level {
        GeographyLevel::Nation => 1,
        GeographyLevel::State => 52,
        GeographyLevel::Metro => 392,
        GeographyLevel::County => 3_143,
        GeographyLevel::Place => 29_880,
        GeographyLevel::Zcta => 33_774,
        GeographyLevel::Tract => 85_528,
        GeographyLevel::BlockGroup => 220_740,
    }
}

pub const PHASE_NAMES: [&str; 4] = ["foundation", "expansion", "comprehensive", "detailed"];

/// FIPS codes for the 50 states plus DC and Puerto Rico, the parent set
/// the county/block_group phases fan requests out over.
pub const STATE_FIPS: [&str; 52] = [
    "01", "02", "04", "05", "06", "08", "09", "10", "11", "12", "13", "15", "16", "17", "18", "19", "20", "21", "22",
    "23", "24", "25", "26", "27", "28", "29", "30", "31", "32", "33", "34", "35", "36", "37", "38", "39", "40", "41",
    "42", "44", "45", "46", "47", "48", "49", "50", "51", "53", "54", "55", "56", "72",
];

#[derive(Debug, Clone, Copy)]
pub struct Phase {
    pub name: &'static str,
    pub priority: u8,
    pub description: &'static str,
    pub dependencies: &'static [&'static str],
    pub geographies: &'static [GeographyLevel],
    pub variables: &'static [&'static str],
}

pub const PHASES: [Phase; 4] = [
    Phase {
        name: "foundation",
        priority: 100,
        description: "Nation- and state-level core demographics",
        dependencies: &[],
        geographies: &[GeographyLevel::Nation, GeographyLevel::State],
        variables: &["B01003_001E", "B19013_001E"],
    },
    Phase {
        name: "expansion",
        priority: 75,
        description: "Metro and county coverage",
        dependencies: &["foundation"],
        geographies: &[GeographyLevel::Metro, GeographyLevel::County],
        variables: &["B01003_001E", "B19013_001E", "B25077_001E"],
    },
    Phase {
        name: "comprehensive",
        priority: 50,
        description: "Place and zip-code-tabulation-area coverage",
        dependencies: &["foundation", "expansion"],
        geographies: &[GeographyLevel::Place, GeographyLevel::Zcta],
        variables: &["B01003_001E", "B19013_001E", "B25077_001E", "B15003_022E"],
    },
    Phase {
        name: "detailed",
        priority: 25,
        description: "Tract and block-group fine-grained coverage",
        dependencies: &["foundation", "expansion", "comprehensive"],
        geographies: &[GeographyLevel::Tract, GeographyLevel::BlockGroup],
        variables: &["B01003_001E", "B19013_001E", "B25077_001E", "B15003_022E", "B08301_001E"],
    },
];

pub fn phase_by_name(name: &str) -> Option<&'static Phase> {
    PHASES.iter().find(|p| p.name == name)
}

/// `job_priority = round(0.5·geo_weight + 0.3·mean(var_weights) + 0.2·phase_weight)`
pub fn job_priority(geo_level: GeographyLevel, variables: &[String], phase_weight: u8) -> u8 {
    let geo_weight = geography_priority(geo_level) as f64;
    let var_mean = if variables.is_empty() {
        0.0
    } else {
        variables.iter().map(|v| variable_priority(v).weight as f64).sum::<f64>() / variables.len() as f64
    };
    let score = 0.5 * geo_weight + 0.3 * var_mean + 0.2 * phase_weight as f64;
    score.round().clamp(0.0, 100.0) as u8
}

/// Tie-break key for equal-priority jobs: earlier `created_at` wins.
pub fn priority_tiebreak(a_priority: u8, a_created_at: DateTime<Utc>, b_priority: u8, b_created_at: DateTime<Utc>) -> std::cmp::Ordering {
    a_priority.cmp(&b_priority).then_with(|| b_created_at.cmp(&a_created_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_form_a_strict_dependency_chain() {
        assert!(phase_by_name("foundation").unwrap().dependencies.is_empty());
        assert_eq!(phase_by_name("detailed").unwrap().dependencies.len(), 3);
    }

    #[test]
    fn job_priority_is_bounded() {
        let p = job_priority(GeographyLevel::BlockGroup, &["B08301_001E".to_string()], 10);
        assert!(p <= 100);
    }

    #[test]
    fn estimate_matches_spec_example() {
        assert_eq!(estimated_record_count(GeographyLevel::BlockGroup), 220_740);
    }

    #[test]
    fn state_fips_count_matches_state_level_estimate() {
        assert_eq!(STATE_FIPS.len() as u64, estimated_record_count(GeographyLevel::State));
    }
}
