//! Aggregate observation reports.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
#[cfg(feature = "ts")]
use ts_rs::TS;

/// Date range for summaries and exports. Both ends are inclusive and optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryFilters {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl SummaryFilters {
    pub fn between(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        Self { from, to }
    }

    /// Query parameters, skipping unset bounds
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(from) = self.from {
            pairs.push(("from", from.format("%Y-%m-%d").to_string()));
        }
        if let Some(to) = self.to {
            pairs.push(("to", to.format("%Y-%m-%d").to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS))]
pub struct AppliedFilters {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS))]
pub struct SpeciesCount {
    pub label: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS))]
pub struct DateCount {
    pub date: NaiveDate,
    pub count: u64,
}

/// Server-computed summary of the user's observations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS))]
pub struct ObservationSummary {
    #[serde(default)]
    pub filters: AppliedFilters,
    pub total_observations: u64,
    pub distinct_species_count: u64,
    #[serde(default)]
    pub species_counts: Vec<SpeciesCount>,
    #[serde(default)]
    pub observations_by_date: Vec<DateCount>,
}

impl ObservationSummary {
    /// The `n` most observed species, most frequent first, ties by name
    pub fn top_species(&self, n: usize) -> Vec<&SpeciesCount> {
        let mut sorted: Vec<&SpeciesCount> = self.species_counts.iter().collect();
        sorted.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
        sorted.truncate(n);
        sorted
    }

    /// The day with the most observations
    pub fn busiest_day(&self) -> Option<&DateCount> {
        self.observations_by_date
            .iter()
            .max_by(|a, b| a.count.cmp(&b.count).then_with(|| b.date.cmp(&a.date)))
    }
}
