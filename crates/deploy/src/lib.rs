//! uplift-deploy - Deployment and upgrade orchestration for upgradeable contracts.
//!
//! A [`DeploymentPlan`] lists named deployment and upgrade steps whose
//! arguments may reference the addresses produced by other steps. The
//! [`PlanExecutor`] orders the steps by those references, deploys contracts
//! directly or behind ERC-1967 proxies, upgrades existing proxies in place and
//! verifies sources on a best-effort basis.

mod artifact;
pub use artifact::{ArtifactRef, ArtifactResolver, ContractFactory};

mod error;
pub use error::{DeployError, ErrorKind, PlanFailure};

mod types;
pub use types::{
    ArgValue, DeployedInstance, ProxyKind, ProxyOptions, ResolvedArg, UpgradeOptions,
};

pub mod address_book;
pub mod backends;
pub mod config;
pub mod executor;
pub mod plan;
pub mod proxy;
pub mod rpc;
pub mod strategy;
pub mod traits;
pub mod upgrade;
pub mod verify;

pub use address_book::AddressBook;
pub use config::{ExecutorConfig, VerificationConfig};
pub use executor::{CancelHandle, ExecutionReport, PlanExecutor, StepReport, StepState};
pub use plan::{DeploymentPlan, DeploymentStep, ProxyRef, Step, UpgradeStep};
pub use strategy::DeploymentStrategy;
pub use upgrade::{UpgradeCoordinator, UpgradeOutcome};
pub use verify::VerificationService;
