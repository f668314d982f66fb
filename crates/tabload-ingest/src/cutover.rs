//! Promotion of a staging table to production
//!
//! With a store that can swap atomically, production and staging exchange
//! names in one transaction. Otherwise the sequence is:
//!
//! 1. rename production (if any) to the retired name
//! 2. rename staging to production
//! 3. drop the retired table
//!
//! Between 1 and 2 the production name resolves to nothing. The two renames
//! are issued back to back; a failure of step 2 is raised as an alarm and
//! left for an operator. Step 3 failing only leaves a stale table behind.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::notify::Notifier;
use crate::schema::PartitionRoute;
use crate::store::{StoreError, TableCatalog};

#[derive(Error, Debug)]
pub enum CutoverError {
    #[error("staging table {0} does not exist")]
    StagingMissing(String),

    #[error("failed to retire production table {table}: {source}")]
    RetireProduction {
        table: String,
        #[source]
        source: StoreError,
    },

    /// Production was renamed away but staging could not take its place
    #[error(
        "production table {table} is ABSENT: staging could not be promoted \
         (previous data is in {retired}): {source}"
    )]
    PromoteStaging {
        table: String,
        retired: String,
        #[source]
        source: StoreError,
    },

    #[error("atomic swap for {table} failed: {source}")]
    SwapFailed {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("could not inspect tables for {table}: {source}")]
    Inspect {
        table: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CutoverReport {
    pub partition: String,
    pub atomic: bool,
    pub replaced_existing: bool,
    pub retired_dropped: bool,
    pub warnings: Vec<String>,
}

pub struct CutoverManager {
    catalog: Arc<dyn TableCatalog>,
    notifier: Arc<dyn Notifier>,
}

impl CutoverManager {
    pub fn new(catalog: Arc<dyn TableCatalog>, notifier: Arc<dyn Notifier>) -> Self {
        Self { catalog, notifier }
    }

    pub async fn promote(&self, route: &PartitionRoute) -> Result<CutoverReport, CutoverError> {
        let tables = &route.tables;
        let mut report = CutoverReport {
            partition: route.key.clone(),
            atomic: self.catalog.supports_atomic_swap(),
            ..Default::default()
        };

        let staging_exists = self
            .catalog
            .table_exists(&tables.staging)
            .await
            .map_err(|source| CutoverError::Inspect {
                table: tables.staging.to_string(),
                source,
            })?;
        if !staging_exists {
            return Err(CutoverError::StagingMissing(tables.staging.to_string()));
        }

        // A retired table left over from an earlier cutover would block step 1
        if let Err(e) = self.catalog.drop_table(&tables.retired).await {
            let warning = format!("could not clear stale {}: {}", tables.retired, e);
            warn!(partition = %route.key, "{}", warning);
            report.warnings.push(warning);
        }

        if report.atomic {
            report.replaced_existing =
                self.catalog
                    .swap_in(tables)
                    .await
                    .map_err(|source| CutoverError::SwapFailed {
                        table: tables.production.to_string(),
                        source,
                    })?;
            info!(
                partition = %route.key,
                production = %tables.production,
                replaced = report.replaced_existing,
                "Swapped staging into production"
            );
        } else {
            report.replaced_existing = self.rename_pair(route).await?;
        }

        if report.replaced_existing {
            match self.catalog.drop_table(&tables.retired).await {
                Ok(()) => {
                    report.retired_dropped = true;
                    info!(partition = %route.key, table = %tables.retired, "Dropped retired table");
                }
                Err(e) => {
                    let warning = format!(
                        "cutover for {} succeeded but {} could not be dropped: {}",
                        route.key, tables.retired, e
                    );
                    warn!(partition = %route.key, "{}", warning);
                    self.notifier.notify(&warning).await;
                    report.warnings.push(warning);
                }
            }
        }

        Ok(report)
    }

    /// Steps 1 and 2; returns whether a production table was retired
    async fn rename_pair(&self, route: &PartitionRoute) -> Result<bool, CutoverError> {
        let tables = &route.tables;

        let production_exists = self
            .catalog
            .table_exists(&tables.production)
            .await
            .map_err(|source| CutoverError::Inspect {
                table: tables.production.to_string(),
                source,
            })?;

        if production_exists {
            self.catalog
                .rename_table(&tables.production, &tables.retired)
                .await
                .map_err(|source| CutoverError::RetireProduction {
                    table: tables.production.to_string(),
                    source,
                })?;
        }

        if let Err(source) = self
            .catalog
            .rename_table(&tables.staging, &tables.production)
            .await
        {
            let err = CutoverError::PromoteStaging {
                table: tables.production.to_string(),
                retired: tables.retired.to_string(),
                source,
            };
            error!(partition = %route.key, alarm = true, "{}", err);
            self.notifier.notify(&format!("ALARM: {}", err)).await;
            return Err(err);
        }

        info!(
            partition = %route.key,
            production = %tables.production,
            replaced = production_exists,
            "Renamed staging into production"
        );
        Ok(production_exists)
    }
}
