//! Deployment plans: named steps linked by address placeholders.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ArgValue, DeployError, ProxyOptions, UpgradeOptions};

fn enabled_by_default() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

/// Deploy a new contract, directly or behind a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStep {
    /// Unique step name. Other steps refer to the deployed address by it.
    pub name: String,
    /// Logical contract name.
    pub artifact: String,
    /// Fully qualified source path, required when `artifact` is ambiguous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Constructor arguments, or initializer arguments for proxied deployments.
    #[serde(default)]
    pub args: Vec<ArgValue>,
    /// Deploy behind an upgradeable proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyOptions>,
    /// Overrides the executor's verification default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    #[serde(default = "enabled_by_default", skip_serializing_if = "is_true")]
    pub enabled: bool,
}

impl DeploymentStep {
    pub fn new(name: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artifact: artifact.into(),
            source: None,
            args: Vec::new(),
            proxy: None,
            verify: None,
            enabled: true,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<ArgValue>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn proxy(mut self, options: ProxyOptions) -> Self {
        self.proxy = Some(options);
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = Some(verify);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// The proxy an upgrade step targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxyRef {
    Address(Address),
    AddressOf { address_of: String },
}

/// Point an existing proxy at a new implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStep {
    pub name: String,
    pub proxy: ProxyRef,
    /// Logical name of the new implementation.
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub options: UpgradeOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    #[serde(default = "enabled_by_default", skip_serializing_if = "is_true")]
    pub enabled: bool,
}

impl UpgradeStep {
    pub fn new(
        name: impl Into<String>,
        proxy: ProxyRef,
        artifact: impl Into<String>,
        options: UpgradeOptions,
    ) -> Self {
        Self {
            name: name.into(),
            proxy,
            artifact: artifact.into(),
            source: None,
            options,
            verify: None,
            enabled: true,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = Some(verify);
        self
    }
}

/// One unit of work in a [`DeploymentPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::From)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Deploy(DeploymentStep),
    Upgrade(UpgradeStep),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Self::Deploy(step) => &step.name,
            Self::Upgrade(step) => &step.name,
        }
    }

    pub fn artifact(&self) -> &str {
        match self {
            Self::Deploy(step) => &step.artifact,
            Self::Upgrade(step) => &step.artifact,
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            Self::Deploy(step) => step.source.as_deref(),
            Self::Upgrade(step) => step.source.as_deref(),
        }
    }

    pub fn verify(&self) -> Option<bool> {
        match self {
            Self::Deploy(step) => step.verify,
            Self::Upgrade(step) => step.verify,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Self::Deploy(step) => step.enabled,
            Self::Upgrade(step) => step.enabled,
        }
    }

    /// Names this step reads addresses from, in argument order.
    pub fn dependencies(&self) -> Vec<&str> {
        match self {
            Self::Deploy(step) => step.args.iter().filter_map(ArgValue::dependency).collect(),
            Self::Upgrade(step) => match &step.proxy {
                ProxyRef::AddressOf { address_of } => vec![address_of.as_str()],
                ProxyRef::Address(_) => Vec::new(),
            },
        }
    }
}

/// An ordered set of deployment and upgrade steps.
///
/// Steps form a DAG through `address_of` placeholders. Placeholders may also
/// name an entry of `imports`, an address deployed outside the plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    #[serde(default)]
    pub imports: BTreeMap<String, Address>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

impl DeploymentPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `address` available to placeholders as `name`.
    pub fn import(mut self, name: impl Into<String>, address: Address) -> Self {
        self.imports.insert(name.into(), address);
        self
    }

    pub fn step(mut self, step: impl Into<Step>) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Parse a plan from its TOML form.
    pub fn from_toml_str(content: &str) -> Result<Self, DeployError> {
        toml::from_str(content).map_err(|err| DeployError::InvalidPlan(err.to_string()))
    }

    /// Load a plan from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read plan from {}", path.display()))?;
        let plan = Self::from_toml_str(&content)
            .context(format!("Failed to parse plan {}", path.display()))?;
        tracing::debug!(path = %path.display(), steps = plan.steps.len(), "Plan loaded");
        Ok(plan)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize plan to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write plan to {}", path.display()))?;
        Ok(())
    }

    /// Steps taking part in execution.
    pub fn enabled_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|step| step.enabled())
    }

    /// Order the enabled steps so that every step comes after the steps it
    /// depends on. Independent steps keep their declaration order.
    ///
    /// Placeholders may reference steps declared later. A placeholder naming
    /// neither an enabled step nor an import fails with
    /// [`DeployError::UnresolvedDependency`] and a cycle with
    /// [`DeployError::DependencyCycle`].
    pub fn execution_order(&self) -> Result<Vec<&Step>, DeployError> {
        let steps: Vec<&Step> = self.enabled_steps().collect();

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
        for (position, step) in steps.iter().enumerate() {
            if index.insert(step.name(), position).is_some() {
                return Err(DeployError::InvalidPlan(format!(
                    "step name `{}` is used more than once",
                    step.name()
                )));
            }
        }

        // dependents[i] lists the steps waiting on step i.
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        let mut pending: Vec<usize> = vec![0; steps.len()];

        for (position, step) in steps.iter().enumerate() {
            let mut seen = BTreeSet::new();
            for dependency in step.dependencies() {
                match index.get(dependency) {
                    Some(&upstream) => {
                        if seen.insert(upstream) {
                            dependents[upstream].push(position);
                            pending[position] += 1;
                        }
                    }
                    None if self.imports.contains_key(dependency) => {}
                    None => {
                        return Err(DeployError::UnresolvedDependency {
                            step: step.name().to_string(),
                            missing: dependency.to_string(),
                        });
                    }
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(steps.len());

        while let Some(next) = ready.pop_first() {
            order.push(steps[next]);
            for &dependent in &dependents[next] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < steps.len() {
            return Err(DeployError::DependencyCycle {
                steps: find_cycle(&steps, &index, &pending),
            });
        }

        Ok(order)
    }

    /// SHA-256 over the enabled steps and imports, hex encoded.
    ///
    /// Disabled steps do not change the fingerprint.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Canonical<'a> {
            imports: &'a BTreeMap<String, Address>,
            steps: Vec<&'a Step>,
        }

        let json = serde_json::to_string(&Canonical {
            imports: &self.imports,
            steps: self.enabled_steps().collect(),
        })?;

        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Walk unresolved dependencies from a step left over by the topological
/// sort until a step repeats. Every leftover step has a leftover dependency,
/// so the walk always closes a cycle.
fn find_cycle(steps: &[&Step], index: &HashMap<&str, usize>, pending: &[usize]) -> Vec<String> {
    let stuck = |position: usize| pending[position] > 0;

    let Some(start) = (0..steps.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = steps[current]
            .dependencies()
            .into_iter()
            .filter_map(|dependency| index.get(dependency).copied())
            .find(|&upstream| stuck(upstream));

        let Some(next) = next else {
            break;
        };

        if let Some(position) = path.iter().position(|&seen| seen == next) {
            let mut cycle: Vec<String> = path[position..]
                .iter()
                .map(|&i| steps[i].name().to_string())
                .collect();
            cycle.push(steps[next].name().to_string());
            return cycle;
        }

        path.push(next);
        current = next;
    }

    path.iter().map(|&i| steps[i].name().to_string()).collect()
}
