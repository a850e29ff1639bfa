//! HTTP client for the external statistical service: builds `get=`/`for=`/
//! `in=`/`key=` query parameters and parses the header-row-then-data-rows
//! JSON envelope into internal [`CensusRecord`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CensusRecord, GeographyLevel, Value};

#[derive(Debug, thiserror::Error)]
pub enum CensusClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("rate limited by statistical service")]
    RateLimited,
}

#[derive(Debug, Clone, Serialize)]
pub struct CensusQuery {
    pub dataset_base_url: String,
    pub variables: Vec<String>,
    pub level: GeographyLevel,
    pub codes: Vec<String>,
    pub parent: Option<String>,
    pub api_key: Option<String>,
    pub year: i32,
    pub dataset: String,
}

fn for_clause(level: GeographyLevel, codes: &[String]) -> String {
    let clause_level = match level {
        GeographyLevel::State => "state",
        GeographyLevel::County => "county",
        GeographyLevel::Zcta => "zip code tabulation area",
        GeographyLevel::BlockGroup => "block group",
        other => other.as_str(),
    };
    if codes.is_empty() {
        format!("{clause_level}:*")
    } else {
        format!("{clause_level}:{}", codes.join(","))
    }
}

pub struct CensusClient {
    http: reqwest::Client,
}

impl CensusClient {
    pub fn new(request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder().timeout(request_timeout).build().expect("reqwest client builder");
        Self { http }
    }

    pub async fn fetch(&self, query: &CensusQuery) -> Result<Vec<CensusRecord>, CensusClientError> {
        if query.variables.len() > 50 {
            return Err(CensusClientError::MalformedResponse("more than 50 variables in a single call".to_string()));
        }

        let mut request = self
            .http
            .get(&query.dataset_base_url)
            .query(&[("get", query.variables.join(","))])
            .query(&[("for", for_clause(query.level, &query.codes))]);

        if let Some(parent) = &query.parent {
            request = request.query(&[("in", parent.as_str())]);
        }
        if let Some(api_key) = &query.api_key {
            request = request.query(&[("key", api_key.as_str())]);
        }

        let response = request.send().await?;

        if response.status().as_u16() == 429 {
            return Err(CensusClientError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(CensusClientError::MalformedResponse(format!("status {}", response.status())));
        }

        let rows: Vec<Vec<String>> = response.json().await.map_err(|_| {
            CensusClientError::MalformedResponse("response body is not a JSON array of arrays".to_string())
        })?;

        parse_envelope(&rows, query)
    }
}

/// Maps the statistical service's row-oriented envelope (headers row then
/// data rows) into internal records. Geography code derivation is
/// level-specific: each finer level's code is its own digits appended to
/// its parent's (state -> county -> tract -> block group).
fn parse_envelope(rows: &[Vec<String>], query: &CensusQuery) -> Result<Vec<CensusRecord>, CensusClientError> {
    let Some(headers) = rows.first() else {
        return Err(CensusClientError::MalformedResponse("response missing headers row".to_string()));
    };
    if headers.is_empty() {
        return Err(CensusClientError::MalformedResponse("empty headers row".to_string()));
    }

    let state_idx = headers.iter().position(|h| h == "state");
    let county_idx = headers.iter().position(|h| h == "county");
    let tract_idx = headers.iter().position(|h| h == "tract");
    let block_group_idx = headers.iter().position(|h| h == "block group");
    let zip_idx = headers.iter().position(|h| h == "zip code tabulation area");
    let name_idx = headers.iter().position(|h| h == "NAME");

    let mut records = Vec::new();

    for data_row in rows.iter().skip(1) {
        if data_row.len() != headers.len() {
            return Err(CensusClientError::MalformedResponse("row length does not match headers".to_string()));
        }

        let state_code = state_idx.map(|i| data_row[i].clone());
        let county_code = county_idx.map(|i| format!("{}{}", state_code.clone().unwrap_or_default(), data_row[i]));
        let tract_code = tract_idx.map(|i| format!("{}{}", county_code.clone().unwrap_or_default(), data_row[i]));
        let block_group_code =
            block_group_idx.map(|i| format!("{}{}", tract_code.clone().unwrap_or_default(), data_row[i]));
        let zip_code = zip_idx.map(|i| data_row[i].clone());
        let geography_name = name_idx.map(|i| data_row[i].clone());

        let geography_code = match query.level {
            GeographyLevel::State => state_code.clone().unwrap_or_default(),
            GeographyLevel::County => county_code.clone().unwrap_or_default(),
            GeographyLevel::Zcta => zip_code.clone().unwrap_or_default(),
            GeographyLevel::BlockGroup => block_group_code.clone().unwrap_or_default(),
            _ => state_code.clone().unwrap_or_default(),
        };

        for (i, header) in headers.iter().enumerate() {
            if !query.variables.contains(header) {
                continue;
            }
            records.push(CensusRecord {
                dataset: query.dataset.clone(),
                year: query.year,
                geography_level: query.level,
                geography_code: geography_code.clone(),
                geography_name: geography_name.clone(),
                state_code: state_code.clone(),
                county_code: county_code.clone(),
                tract_code: tract_code.clone(),
                block_group_code: block_group_code.clone(),
                zip_code: zip_code.clone(),
                variable_name: header.clone(),
                variable_value: Value::parse(&data_row[i]),
                margin_of_error: None,
            });
        }
    }

    Ok(records)
}

#[derive(Debug, Deserialize)]
pub struct DatasetCatalogEntry {
    pub dataset_id: String,
    pub name: String,
    pub description: String,
    pub base_url_pattern: String,
    pub available_years: Vec<i32>,
    pub geographic_levels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> CensusQuery {
        CensusQuery {
            dataset_base_url: "https://api.census.gov/data/2023/acs/acs5".to_string(),
            variables: vec!["B01003_001E".to_string()],
            level: GeographyLevel::State,
            codes: vec![],
            parent: None,
            api_key: None,
            year: 2023,
            dataset: "acs5".to_string(),
        }
    }

    #[test]
    fn parses_state_level_envelope() {
        let rows = vec![
            vec!["NAME".to_string(), "B01003_001E".to_string(), "state".to_string()],
            vec!["California".to_string(), "39000000".to_string(), "06".to_string()],
        ];
        let records = parse_envelope(&rows, &query()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].geography_code, "06");
        assert_eq!(records[0].variable_value, Value::Int64(39_000_000));
    }

    #[test]
    fn missing_headers_row_is_malformed() {
        let rows: Vec<Vec<String>> = vec![];
        assert!(parse_envelope(&rows, &query()).is_err());
    }

    #[test]
    fn over_50_variables_rejected_before_request() {
        let mut q = query();
        q.variables = (0..51).map(|i| format!("VAR{i}")).collect();
        let client = CensusClient::new(Duration::from_secs(1));
        let result = futures::executor::block_on(client.fetch(&q));
        assert!(result.is_err());
    }
}
