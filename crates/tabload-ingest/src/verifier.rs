//! Completeness check of a staging table against the ledger's expected count

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::schema::PartitionRoute;
use crate::store::TableCatalog;

pub const DEFAULT_SLACK: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "short_by", rename_all = "snake_case")]
pub enum Verdict {
    Match,
    ShortBy(u64),
}

impl Verdict {
    pub fn compare(expected: u64, persisted: u64) -> Self {
        match expected.saturating_sub(persisted) {
            0 => Verdict::Match,
            n => Verdict::ShortBy(n),
        }
    }

    pub fn shortfall(self) -> u64 {
        match self {
            Verdict::Match => 0,
            Verdict::ShortBy(n) => n,
        }
    }

    /// Whether cutover may proceed with this verdict
    pub fn within(self, slack: u64) -> bool {
        self.shortfall() <= slack
    }
}

/// Result of one verification, with the counts it was based on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub expected: u64,
    pub persisted: u64,
    pub verdict: Verdict,
    pub slack: u64,
}

impl Verification {
    /// Nothing expected or nothing persisted; never promoted
    pub fn is_empty(&self) -> bool {
        self.expected == 0 || self.persisted == 0
    }

    pub fn accepted(&self) -> bool {
        !self.is_empty() && self.verdict.within(self.slack)
    }
}

pub struct CompletenessVerifier<'a> {
    catalog: &'a dyn TableCatalog,
    slack: u64,
}

impl<'a> CompletenessVerifier<'a> {
    pub fn new(catalog: &'a dyn TableCatalog, slack: u64) -> Self {
        Self { catalog, slack }
    }

    /// Count the route's staging table and compare to `expected`
    pub async fn verify(&self, route: &PartitionRoute, expected: u64) -> Result<Verification> {
        let persisted = self.catalog.count_rows(&route.tables.staging).await?;
        let verdict = Verdict::compare(expected, persisted);
        let verification = Verification {
            expected,
            persisted,
            verdict,
            slack: self.slack,
        };

        if verification.is_empty() {
            warn!(
                partition = %route.key,
                expected,
                persisted,
                "Empty source or staging table"
            );
        } else if verification.accepted() {
            info!(
                partition = %route.key,
                expected,
                persisted,
                short_by = verdict.shortfall(),
                "Staging table verified"
            );
        } else {
            warn!(
                partition = %route.key,
                expected,
                persisted,
                short_by = verdict.shortfall(),
                slack = self.slack,
                "Staging table is short of the expected row count"
            );
        }

        Ok(verification)
    }
}
