//! Staleness policy for the price snapshot.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::duration::format_duration;
use crate::market_data::PriceSnapshot;

/// Result of a staleness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessCheck {
    pub is_stale: bool,
    pub age: Option<Duration>,
    pub threshold: Duration,
}

impl StalenessCheck {
    pub fn stale(age: Duration, threshold: Duration) -> Self {
        Self { is_stale: true, age: Some(age), threshold }
    }

    pub fn fresh(age: Duration, threshold: Duration) -> Self {
        Self { is_stale: false, age: Some(age), threshold }
    }

    pub fn missing(threshold: Duration) -> Self {
        Self { is_stale: true, age: None, threshold }
    }

    pub fn freshness(&self) -> Freshness {
        match (self.age, self.is_stale) {
            (None, _) => Freshness::Empty,
            (Some(_), true) => Freshness::Stale,
            (Some(_), false) => Freshness::Fresh,
        }
    }
}

/// A snapshot is fresh while `now - lastUpdated < threshold`. A snapshot
/// that was never refreshed counts as missing, as does no snapshot at all.
pub fn check_snapshot_staleness(
    snapshot: Option<&PriceSnapshot>,
    threshold: Duration,
    now: DateTime<Utc>,
) -> StalenessCheck {
    match snapshot.and_then(|s| s.age(now)) {
        Some(age) if age >= threshold => StalenessCheck::stale(age, threshold),
        Some(age) => StalenessCheck::fresh(age, threshold),
        None => StalenessCheck::missing(threshold),
    }
}

/// Log snapshot staleness check results.
pub fn log_snapshot_staleness(check: &StalenessCheck) {
    let age_str = check
        .age
        .map(format_duration)
        .unwrap_or_else(|| "never".to_string());
    let threshold_str = format_duration(check.threshold);

    debug!(
        age = %age_str,
        threshold = %threshold_str,
        status = %check.freshness(),
        "price snapshot staleness check"
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Empty,
    Fresh,
    Stale,
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Freshness::Empty => "empty",
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
        })
    }
}

/// Observable cache state: freshness plus the orthogonal refreshing flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheState {
    pub freshness: Freshness,
    pub refreshing: bool,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.refreshing {
            write!(f, "{} (refreshing)", self.freshness)
        } else {
            write!(f, "{}", self.freshness)
        }
    }
}
