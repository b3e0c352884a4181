//! SAM.gov Get Opportunities Public API (v2 search).

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use gcpt_core::ExternalListing;
use gcpt_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{AdapterError, OpportunitySource, SearchPage, SearchQuery};

pub const DEFAULT_BASE_URL: &str = "https://api.sam.gov";
const SEARCH_PATH: &str = "/opportunities/v2/search";
const SAM_DATE_FORMAT: &str = "%m/%d/%Y";

#[derive(Debug, Clone)]
pub struct SamGovConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl SamGovConfig {
    pub fn from_env() -> Self {
        let base_url = env::var("SAM_API_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let api_key = env::var("SAM_API_KEY").ok().filter(|v| !v.trim().is_empty());
        Self { base_url, api_key }
    }

    pub fn search_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), SEARCH_PATH)
    }
}

#[derive(Debug, Clone)]
pub struct SamGovAdapter {
    http: Arc<HttpFetcher>,
    config: SamGovConfig,
}

impl SamGovAdapter {
    pub fn new(http: Arc<HttpFetcher>, config: SamGovConfig) -> Self {
        Self { http, config }
    }
}

/// Query parameters for one search page, API key first.
pub fn search_params(query: &SearchQuery, api_key: &str) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("api_key", api_key.to_string()),
        ("postedFrom", query.posted_from.format(SAM_DATE_FORMAT).to_string()),
        ("postedTo", query.posted_to.format(SAM_DATE_FORMAT).to_string()),
        ("limit", query.limit.to_string()),
        ("offset", query.offset.to_string()),
    ];
    if let Some(code) = &query.naics_code {
        params.push(("ncode", code.clone()));
    }
    if let Some(keyword) = &query.keyword {
        params.push(("title", keyword.clone()));
    }
    if let Some(state) = &query.state {
        params.push(("state", state.clone()));
    }
    if let Some(set_aside) = &query.set_aside {
        params.push(("typeOfSetAside", set_aside.clone()));
    }
    params
}

#[async_trait]
impl OpportunitySource for SamGovAdapter {
    fn source_id(&self) -> &'static str {
        "sam-gov"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, AdapterError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(AdapterError::MissingApiKey)?;
        let url = self.config.search_url();
        let params = search_params(query, api_key);
        let response: SamSearchResponse = self.http.get_json(&url, &params).await?;
        let page = parse_search_response(response);
        debug!(
            naics = query.naics_code.as_deref().unwrap_or("all"),
            offset = query.offset,
            returned = page.listings.len(),
            total = page.total_records,
            "sam.gov page"
        );
        Ok(page)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamSearchResponse {
    #[serde(default)]
    pub total_records: u64,
    #[serde(default)]
    pub opportunities_data: Vec<SamNotice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamNotice {
    pub notice_id: Option<String>,
    pub title: Option<String>,
    pub solicitation_number: Option<String>,
    pub full_parent_path_name: Option<String>,
    pub department: Option<String>,
    #[serde(rename = "type")]
    pub notice_type: Option<String>,
    pub naics_code: Option<String>,
    pub classification_code: Option<String>,
    pub type_of_set_aside: Option<String>,
    pub type_of_set_aside_description: Option<String>,
    pub posted_date: Option<String>,
    #[serde(rename = "responseDeadLine")]
    pub response_deadline: Option<String>,
    pub archive_date: Option<String>,
    pub active: Option<JsonValue>,
    pub award: Option<SamAward>,
    pub place_of_performance: Option<SamPlace>,
    #[serde(default)]
    pub point_of_contact: Vec<SamContact>,
    pub description: Option<String>,
    pub ui_link: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamAward {
    pub amount: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamPlace {
    pub state: Option<SamCode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamCode {
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamContact {
    pub full_name: Option<String>,
    pub email: Option<String>,
}

fn text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// SAM.gov mixes RFC 3339 stamps, bare dates and space-separated times.
pub fn parse_sam_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%d %H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for fmt in ["%Y-%m-%d", SAM_DATE_FORMAT] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
        }
    }
    None
}

fn parse_amount(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.replace([',', '$'], "").trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite() && *v >= 0.0)
}

fn parse_active(value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "yes" | "true" | "y"),
        _ => true,
    }
}

fn date_field(raw: Option<&str>, field: &str, notice_id: &str) -> Option<DateTime<Utc>> {
    let raw = raw?;
    let parsed = parse_sam_date(raw);
    if parsed.is_none() {
        warn!(notice_id, field, value = raw, "unparseable sam.gov date");
    }
    parsed
}

fn notice_to_listing(notice: SamNotice) -> Option<ExternalListing> {
    let notice_id = text(notice.notice_id)?;
    let title = text(notice.title).unwrap_or_else(|| notice_id.clone());

    let path = text(notice.full_parent_path_name);
    let segments = path
        .as_deref()
        .map(|p| p.split('.').map(str::trim).filter(|s| !s.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();
    let agency = text(notice.department).or_else(|| segments.first().map(|s| s.to_string()));
    let office = (segments.len() > 1)
        .then(|| segments.last().map(|s| s.to_string()))
        .flatten();

    let point_of_contact = notice.point_of_contact.into_iter().next().and_then(|c| {
        match (text(c.full_name), text(c.email)) {
            (Some(name), Some(email)) => Some(format!("{name} <{email}>")),
            (Some(name), None) => Some(name),
            (None, Some(email)) => Some(email),
            (None, None) => None,
        }
    });

    let posted_date = date_field(notice.posted_date.as_deref(), "postedDate", &notice_id);
    let response_deadline =
        date_field(notice.response_deadline.as_deref(), "responseDeadLine", &notice_id);
    let archive_date = date_field(notice.archive_date.as_deref(), "archiveDate", &notice_id);

    Some(ExternalListing {
        solicitation_number: text(notice.solicitation_number),
        title,
        agency,
        office,
        notice_type: text(notice.notice_type),
        naics_code: text(notice.naics_code),
        classification_code: text(notice.classification_code),
        set_aside_type: text(notice.type_of_set_aside),
        set_aside_description: text(notice.type_of_set_aside_description),
        posted_date,
        response_deadline,
        archive_date,
        estimated_value: notice
            .award
            .and_then(|a| a.amount)
            .as_ref()
            .and_then(parse_amount),
        place_of_performance_state: notice
            .place_of_performance
            .and_then(|p| p.state)
            .and_then(|s| text(s.code)),
        point_of_contact,
        description_url: text(notice.description),
        ui_link: text(notice.ui_link),
        active: parse_active(notice.active.as_ref()),
        notice_id,
    })
}

/// Notices without a notice id are dropped; everything else is best-effort.
pub fn parse_search_response(response: SamSearchResponse) -> SearchPage {
    let received = response.opportunities_data.len();
    let listings = response
        .opportunities_data
        .into_iter()
        .filter_map(notice_to_listing)
        .collect::<Vec<_>>();
    if listings.len() < received {
        warn!(dropped = received - listings.len(), "sam.gov notices without noticeId");
    }
    SearchPage {
        total_records: response.total_records,
        received: received as u32,
        listings,
    }
}
