//! External listing sources feeding the opportunity mirror.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use gcpt_core::ExternalListing;
use gcpt_storage::FetchError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod fixture;
pub mod sam_gov;

pub use fixture::FixtureSource;
pub use sam_gov::{parse_search_response, SamGovAdapter, SamGovConfig, SamSearchResponse};

pub const CRATE_NAME: &str = "gcpt-adapters";

/// Upper bound SAM.gov accepts for a single page.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// One page request against a listing source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub naics_code: Option<String>,
    pub keyword: Option<String>,
    pub state: Option<String>,
    pub set_aside: Option<String>,
    pub posted_from: NaiveDate,
    pub posted_to: NaiveDate,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub total_records: u64,
    /// Notices the source returned on this page, parsable or not. Paging
    /// advances by this count.
    pub received: u32,
    pub listings: Vec<ExternalListing>,
}

impl SearchPage {
    /// A page where every returned notice parsed.
    pub fn new(total_records: u64, listings: Vec<ExternalListing>) -> Self {
        Self {
            total_records,
            received: listings.len() as u32,
            listings,
        }
    }

    /// Notices returned but not turned into listings.
    pub fn dropped(&self) -> u32 {
        self.received.saturating_sub(self.listings.len() as u32)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("SAM_API_KEY is not configured")]
    MissingApiKey,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response shape: {0}")]
    Parse(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait OpportunitySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, AdapterError>;
}

pub(crate) fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
