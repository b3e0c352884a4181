//! Offline source replaying captured SAM.gov search responses.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use gcpt_core::ExternalListing;

use crate::sam_gov::{parse_search_response, SamSearchResponse};
use crate::{read_json_file, AdapterError, OpportunitySource, SearchPage, SearchQuery};

/// Serves every listing found in a directory of search-response JSON files,
/// filtered and paged the way the live API would.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
    listings: Vec<ExternalListing>,
}

impl FixtureSource {
    pub fn from_dir(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let mut files = std::fs::read_dir(&root)
            .with_context(|| format!("listing fixtures in {}", root.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        files.sort();

        let mut listings = Vec::new();
        for path in &files {
            let response: SamSearchResponse = read_json_file(path)?;
            listings.extend(parse_search_response(response).listings);
        }
        Ok(Self { root, listings })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    fn matches(listing: &ExternalListing, query: &SearchQuery) -> bool {
        if let Some(code) = &query.naics_code {
            if listing.naics_code.as_deref() != Some(code.as_str()) {
                return false;
            }
        }
        if let Some(keyword) = &query.keyword {
            if !listing.title.to_lowercase().contains(&keyword.to_lowercase()) {
                return false;
            }
        }
        if let Some(state) = &query.state {
            if !listing
                .place_of_performance_state
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(state))
            {
                return false;
            }
        }
        if let Some(set_aside) = &query.set_aside {
            if !listing
                .set_aside_type
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(set_aside))
            {
                return false;
            }
        }
        match listing.posted_date {
            Some(posted) => {
                let day = posted.date_naive();
                day >= query.posted_from && day <= query.posted_to
            }
            None => true,
        }
    }
}

#[async_trait]
impl OpportunitySource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "sam-gov-fixtures"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, AdapterError> {
        let hits = self
            .listings
            .iter()
            .filter(|l| Self::matches(l, query))
            .collect::<Vec<_>>();
        let total_records = hits.len() as u64;
        let listings = hits
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();
        Ok(SearchPage::new(total_records, listings))
    }
}
