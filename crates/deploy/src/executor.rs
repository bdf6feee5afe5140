//! Plan execution.

use std::{collections::BTreeMap, sync::Arc};

use alloy_core::primitives::Address;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinSet};

use crate::{
    ArtifactRef, ArtifactResolver, ContractFactory, DeployError, DeployedInstance, PlanFailure,
    ResolvedArg,
    config::ExecutorConfig,
    plan::{DeploymentPlan, DeploymentStep, ProxyRef, Step, UpgradeStep},
    strategy::DeploymentStrategy,
    traits::{ArtifactSource, ChainClient, VerificationRequest, VerificationResult, Verifier},
    upgrade::UpgradeCoordinator,
    verify::VerificationService,
};

/// Step name reported for failures that concern the plan as a whole.
pub const PLAN_STEP: &str = "<plan>";

/// Lifecycle of a step.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepState {
    Pending,
    Resolving,
    Executing,
    Completed,
    Failed,
}

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<DeployedInstance>,
    /// Implementation the proxy pointed at before an upgrade step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_implementation: Option<Address>,
    /// `None` when verification was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    /// Non-fatal problems, such as failed verification.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StepReport {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: StepState::Pending,
            instance: None,
            previous_implementation: None,
            verification: None,
            warnings: Vec::new(),
        }
    }
}

/// Result of running a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Step name to the instance it produced.
    pub instances: BTreeMap<String, DeployedInstance>,
    /// One entry per enabled step, in execution order.
    pub steps: Vec<StepReport>,
}

impl ExecutionReport {
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Address produced by step `name`.
    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.instances.get(name).map(|instance| instance.address)
    }

    /// Every warning, prefixed with its step.
    pub fn warnings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.steps.iter().flat_map(|step| {
            step.warnings
                .iter()
                .map(move |warning| (step.name.as_str(), warning.as_str()))
        })
    }
}

/// Stops a running plan between steps.
///
/// The step in flight when [`CancelHandle::cancel`] is called runs to
/// completion, so no transaction is left half-handled.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

/// A step whose artifact is resolved and loaded.
struct Prepared<'a> {
    step: &'a Step,
    artifact: ArtifactRef,
    factory: ContractFactory,
}

/// Output of a completed step.
struct StepOutcome {
    instance: DeployedInstance,
    previous_implementation: Option<Address>,
    verification: Option<VerificationRequest>,
}

/// Runs [`DeploymentPlan`]s against a chain.
///
/// Steps execute one at a time in dependency order. Verification of a
/// completed step runs in the background while later steps proceed, and is
/// joined before `execute` returns.
pub struct PlanExecutor<A, C, V> {
    resolver: ArtifactResolver<A>,
    chain: C,
    verification: Arc<VerificationService<V>>,
    config: ExecutorConfig,
    cancel: CancelHandle,
}

impl<A, C, V> PlanExecutor<A, C, V>
where
    A: ArtifactSource,
    C: ChainClient,
    V: Verifier,
{
    pub fn new(source: A, chain: C, verifier: V, config: ExecutorConfig) -> Self {
        let verification = VerificationService::new(verifier)
            .retry_delay(config.verification.retry_delay)
            .attempt_timeout(config.verification.attempt_timeout);
        Self {
            resolver: ArtifactResolver::new(source),
            chain,
            verification: Arc::new(verification),
            config,
            cancel: CancelHandle::new(),
        }
    }

    /// Use `cancel` to stop this executor.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn resolver(&self) -> &ArtifactResolver<A> {
        &self.resolver
    }

    /// Check the plan without touching the chain: dependency graph, artifacts
    /// and initializers. Returns the steps in execution order.
    pub fn validate<'p>(&self, plan: &'p DeploymentPlan) -> Result<Vec<&'p Step>, PlanFailure> {
        self.prepare(plan)
            .map(|prepared| prepared.into_iter().map(|p| p.step).collect())
    }

    /// Run every enabled step of `plan`.
    ///
    /// Nothing is submitted unless the whole plan validates. Once execution
    /// starts, the first failing step halts the run; instances deployed before
    /// it stay deployed and are returned in the [`PlanFailure`].
    pub async fn execute(&self, plan: &DeploymentPlan) -> Result<ExecutionReport, PlanFailure> {
        let prepared = self.prepare(plan)?;

        tracing::info!(steps = prepared.len(), "Executing deployment plan");

        let mut instances: BTreeMap<String, DeployedInstance> = BTreeMap::new();
        let mut steps: Vec<StepReport> = prepared
            .iter()
            .map(|p| StepReport::pending(p.step.name()))
            .collect();
        let mut verifications = JoinSet::new();

        for (index, prepared) in prepared.iter().enumerate() {
            let name = prepared.step.name();

            if self.cancel.is_cancelled() {
                tracing::warn!(step = %name, "Cancelled, not starting further steps");
                Self::join_verifications(&mut verifications, &mut steps).await;
                return Err(PlanFailure {
                    step: name.to_string(),
                    error: DeployError::Cancelled,
                    completed: instances.clone(),
                    report: ExecutionReport { instances, steps },
                });
            }

            match self
                .run_step(plan, prepared, &instances, &mut steps[index])
                .await
            {
                Ok(outcome) => {
                    let report = &mut steps[index];
                    report.state = StepState::Completed;
                    report.instance = Some(outcome.instance.clone());
                    report.previous_implementation = outcome.previous_implementation;

                    if let Some(request) = outcome.verification {
                        let service = Arc::clone(&self.verification);
                        verifications.spawn(async move { (index, service.verify(request).await) });
                    }

                    if let Some(implementation) = outcome.instance.implementation {
                        // Earlier records of the same proxy now point at the new implementation.
                        for instance in instances.values_mut() {
                            if instance.is_proxy && instance.address == outcome.instance.address {
                                instance.implementation = Some(implementation);
                            }
                        }
                    }
                    instances.insert(name.to_string(), outcome.instance);
                }
                Err(error) => {
                    steps[index].state = StepState::Failed;
                    tracing::error!(step = %name, %error, "Step failed, halting plan");
                    Self::join_verifications(&mut verifications, &mut steps).await;
                    return Err(PlanFailure {
                        step: name.to_string(),
                        error,
                        completed: instances.clone(),
                        report: ExecutionReport { instances, steps },
                    });
                }
            }
        }

        Self::join_verifications(&mut verifications, &mut steps).await;

        tracing::info!(instances = instances.len(), "Deployment plan completed");

        Ok(ExecutionReport { instances, steps })
    }

    /// Validate the graph and load every artifact up front.
    fn prepare<'p>(&self, plan: &'p DeploymentPlan) -> Result<Vec<Prepared<'p>>, PlanFailure> {
        let plan_failure = |step: &str, error: DeployError| PlanFailure {
            step: step.to_string(),
            error,
            completed: BTreeMap::new(),
            report: ExecutionReport {
                instances: BTreeMap::new(),
                steps: plan
                    .enabled_steps()
                    .map(|step| StepReport::pending(step.name()))
                    .collect(),
            },
        };

        let order = plan.execution_order().map_err(|error| {
            let step = match &error {
                DeployError::UnresolvedDependency { step, .. } => step.clone(),
                _ => PLAN_STEP.to_string(),
            };
            plan_failure(&step, error)
        })?;

        order
            .into_iter()
            .map(|step| {
                self.prepare_step(plan, step)
                    .map_err(|error| plan_failure(step.name(), error))
            })
            .collect()
    }

    fn prepare_step<'p>(
        &self,
        plan: &DeploymentPlan,
        step: &'p Step,
    ) -> Result<Prepared<'p>, DeployError> {
        if plan.imports.contains_key(step.name()) && !self.config.resume {
            return Err(DeployError::InvalidPlan(format!(
                "step `{}` shadows an imported address (enable resume to reuse it)",
                step.name()
            )));
        }

        let artifact = self.resolver.resolve(step.artifact(), step.source())?;
        let factory = self.resolver.factory(&artifact)?;

        if let Step::Deploy(deploy) = step {
            DeploymentStrategy::from_options(deploy.proxy.clone()).preflight(
                &artifact,
                &factory,
                deploy.args.len(),
            )?;
        }

        Ok(Prepared {
            step,
            artifact,
            factory,
        })
    }

    async fn run_step(
        &self,
        plan: &DeploymentPlan,
        prepared: &Prepared<'_>,
        instances: &BTreeMap<String, DeployedInstance>,
        report: &mut StepReport,
    ) -> Result<StepOutcome, DeployError> {
        let name = prepared.step.name();
        let lookup = |dependency: &str| {
            instances
                .get(dependency)
                .map(|instance| instance.address)
                .or_else(|| plan.imports.get(dependency).copied())
        };
        let unresolved = |missing: &str| DeployError::UnresolvedDependency {
            step: name.to_string(),
            missing: missing.to_string(),
        };

        report.state = StepState::Resolving;
        tracing::debug!(step = %name, artifact = %prepared.artifact, "Resolving step");

        if self.config.resume {
            if let Some(&address) = plan.imports.get(name) {
                if let Some(instance) = self.reuse(prepared, address).await? {
                    tracing::info!(step = %name, %address, "Reusing deployed instance");
                    return Ok(StepOutcome {
                        instance,
                        previous_implementation: None,
                        verification: None,
                    });
                }
                tracing::warn!(
                    step = %name,
                    %address,
                    "Imported address has no code, deploying again"
                );
            }
        }

        let verify = prepared.step.verify().unwrap_or(self.config.verify);

        match prepared.step {
            Step::Deploy(step) => {
                let args = step
                    .args
                    .iter()
                    .map(|arg| arg.resolve(lookup))
                    .collect::<Result<Vec<ResolvedArg>, _>>()
                    .map_err(unresolved)?;

                report.state = StepState::Executing;
                tracing::info!(step = %name, artifact = %prepared.artifact, "Deploying");

                let instance = self.deploy(step, prepared, args.clone()).await?;

                Ok(StepOutcome {
                    verification: verify
                        .then(|| VerificationRequest::for_instance(&instance, &args)),
                    instance,
                    previous_implementation: None,
                })
            }
            Step::Upgrade(step) => {
                let proxy = match &step.proxy {
                    ProxyRef::Address(address) => *address,
                    ProxyRef::AddressOf { address_of } => {
                        lookup(address_of).ok_or_else(|| unresolved(address_of))?
                    }
                };

                report.state = StepState::Executing;
                tracing::info!(step = %name, %proxy, artifact = %prepared.artifact, "Upgrading");

                let outcome = self.upgrade(step, prepared, proxy).await?;
                let instance = DeployedInstance {
                    artifact: prepared.artifact.clone(),
                    address: outcome.proxy_address,
                    is_proxy: true,
                    implementation: Some(outcome.new_implementation),
                    transaction_hash: Some(outcome.transaction_hash),
                    reused: false,
                };

                Ok(StepOutcome {
                    verification: verify
                        .then(|| VerificationRequest::for_instance(&instance, &[])),
                    instance,
                    previous_implementation: Some(outcome.previous_implementation),
                })
            }
        }
    }

    async fn deploy(
        &self,
        step: &DeploymentStep,
        prepared: &Prepared<'_>,
        args: Vec<ResolvedArg>,
    ) -> Result<DeployedInstance, DeployError> {
        DeploymentStrategy::from_options(step.proxy.clone())
            .deploy(
                &self.chain,
                &prepared.artifact,
                &prepared.factory,
                args,
                self.config.confirmation_timeout,
            )
            .await
    }

    async fn upgrade(
        &self,
        step: &UpgradeStep,
        prepared: &Prepared<'_>,
        proxy: Address,
    ) -> Result<crate::upgrade::UpgradeOutcome, DeployError> {
        UpgradeCoordinator::new(self.config.confirmation_timeout)
            .upgrade(
                &self.chain,
                proxy,
                &prepared.artifact,
                &prepared.factory,
                &step.options,
            )
            .await
    }

    /// The instance at `address` if an earlier run already deployed it.
    async fn reuse(
        &self,
        prepared: &Prepared<'_>,
        address: Address,
    ) -> Result<Option<DeployedInstance>, DeployError> {
        let code = self
            .chain
            .code_at(address)
            .await
            .map_err(|err| DeployError::ChainUnavailable(err.into()))?;
        if code.is_empty() {
            return Ok(None);
        }

        let is_proxy = match prepared.step {
            Step::Deploy(step) => step.proxy.is_some(),
            Step::Upgrade(_) => true,
        };
        let implementation = if is_proxy {
            Some(
                self.chain
                    .get_current_implementation(address)
                    .await
                    .map_err(|err| DeployError::ChainUnavailable(err.into()))?,
            )
        } else {
            None
        };

        Ok(Some(DeployedInstance {
            artifact: prepared.artifact.clone(),
            address,
            is_proxy,
            implementation,
            transaction_hash: None,
            reused: true,
        }))
    }

    async fn join_verifications(
        verifications: &mut JoinSet<(usize, VerificationResult)>,
        steps: &mut [StepReport],
    ) {
        while let Some(joined) = verifications.join_next().await {
            let (index, result) = match joined {
                Ok(joined) => joined,
                Err(err) => {
                    tracing::warn!(error = %err, "Verification task did not complete");
                    continue;
                }
            };

            let report = &mut steps[index];
            if let VerificationResult::Failed(reason) = &result {
                if let Some(instance) = &report.instance {
                    let warning = DeployError::VerificationFailed {
                        address: instance.implementation.unwrap_or(instance.address),
                        reason: reason.clone(),
                    };
                    report.warnings.push(warning.to_string());
                }
            }
            report.verification = Some(result);
        }
    }
}
