//! Source of compiled contract artifacts.

use crate::{ContractFactory, DeployError};

/// Provides compiled contracts by fully qualified source path.
pub trait ArtifactSource: Send + Sync + 'static {
    /// Every known source path whose contract is named `logical_name`.
    ///
    /// More than one entry means the name is ambiguous.
    fn source_paths(&self, logical_name: &str) -> Vec<String>;

    /// Load the factory compiled from `source_path`.
    ///
    /// Fails with [`DeployError::ArtifactNotFound`] for unknown paths.
    fn get_factory(&self, source_path: &str) -> Result<ContractFactory, DeployError>;
}
