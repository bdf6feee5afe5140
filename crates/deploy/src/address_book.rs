//! Persisted record of deployed addresses.

use std::{collections::BTreeMap, path::Path};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DeployedInstance, executor::ExecutionReport, plan::DeploymentPlan};

/// The instances produced by a plan run, written next to the plan so a later
/// run can import them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBook {
    /// SHA-256 fingerprint of the plan that produced this book.
    pub plan_fingerprint: String,
    pub generated_at: DateTime<Utc>,
    /// Version of uplift that wrote the book.
    pub uplift_version: String,
    pub instances: BTreeMap<String, DeployedInstance>,
}

impl AddressBook {
    pub fn new(plan_fingerprint: String, instances: BTreeMap<String, DeployedInstance>) -> Self {
        Self {
            plan_fingerprint,
            generated_at: Utc::now(),
            uplift_version: env!("CARGO_PKG_VERSION").to_string(),
            instances,
        }
    }

    /// Book for a completed run of `plan`.
    pub fn from_report(plan: &DeploymentPlan, report: &ExecutionReport) -> Result<Self> {
        let fingerprint = plan
            .fingerprint()
            .context("Failed to fingerprint deployment plan")?;
        Ok(Self::new(fingerprint, report.instances.clone()))
    }

    /// Addresses by step name, in the shape plans import them.
    pub fn addresses(&self) -> BTreeMap<String, Address> {
        self.instances
            .iter()
            .map(|(name, instance)| (name.clone(), instance.address))
            .collect()
    }

    /// Whether this book was produced by `plan` as it currently stands.
    pub fn matches(&self, plan: &DeploymentPlan) -> bool {
        plan.fingerprint()
            .is_ok_and(|fingerprint| fingerprint == self.plan_fingerprint)
    }

    /// Save the book as formatted JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize address book")?;

        std::fs::write(path, json)
            .context(format!("Failed to write address book to {}", path.display()))?;

        tracing::info!(path = %path.display(), instances = self.instances.len(), "Address book saved");
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Address book does not exist: {}", path.display());
        }

        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read address book from {}", path.display()))?;

        serde_json::from_str(&content).context("Failed to parse address book JSON")
    }
}
