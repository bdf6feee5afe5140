//! Artifact lookup.

use std::fmt;

use alloy_core::{json_abi::JsonAbi, primitives::Bytes};
use serde::{Deserialize, Serialize};

use crate::{DeployError, traits::ArtifactSource};

/// A compiled contract identified by its logical name and fully qualified source path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Contract name, e.g. `SubscriptionManager`.
    pub logical_name: String,
    /// Fully qualified name, e.g. `contracts/SubscriptionManager.sol:SubscriptionManager`.
    pub source_path: String,
}

impl ArtifactRef {
    pub fn new(logical_name: impl Into<String>, source_path: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            source_path: source_path.into(),
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source_path)
    }
}

/// Creation bytecode and ABI of a contract.
#[derive(Debug, Clone)]
pub struct ContractFactory {
    pub bytecode: Bytes,
    pub abi: JsonAbi,
}

impl ContractFactory {
    pub fn new(bytecode: impl Into<Bytes>, abi: JsonAbi) -> Self {
        Self {
            bytecode: bytecode.into(),
            abi,
        }
    }
}

/// The contract name part of a fully qualified `path/File.sol:Name`.
pub(crate) fn logical_name_of(source_path: &str) -> &str {
    source_path
        .rsplit_once(':')
        .map_or(source_path, |(_, name)| name)
}

/// Resolves logical contract names against an [`ArtifactSource`].
///
/// Lookups are pure: nothing here touches the chain.
#[derive(Debug)]
pub struct ArtifactResolver<A> {
    source: A,
}

impl<A: ArtifactSource> ArtifactResolver<A> {
    pub fn new(source: A) -> Self {
        Self { source }
    }

    /// The underlying artifact source.
    pub fn source(&self) -> &A {
        &self.source
    }

    /// Resolve `logical_name`, using `source_path` to pick between homonyms.
    ///
    /// Without an explicit source path the name must match exactly one artifact,
    /// otherwise the lookup fails with [`DeployError::AmbiguousArtifact`].
    pub fn resolve(
        &self,
        logical_name: &str,
        source_path: Option<&str>,
    ) -> Result<ArtifactRef, DeployError> {
        let candidates = self.source.source_paths(logical_name);

        if let Some(path) = source_path {
            return if candidates.iter().any(|candidate| candidate == path) {
                Ok(ArtifactRef::new(logical_name, path))
            } else {
                Err(DeployError::ArtifactNotFound(path.to_string()))
            };
        }

        match candidates.as_slice() {
            [] => Err(DeployError::ArtifactNotFound(logical_name.to_string())),
            [path] => Ok(ArtifactRef::new(logical_name, path.clone())),
            _ => Err(DeployError::AmbiguousArtifact {
                name: logical_name.to_string(),
                candidates,
            }),
        }
    }

    /// Load the deployable factory for a resolved artifact.
    pub fn factory(&self, artifact: &ArtifactRef) -> Result<ContractFactory, DeployError> {
        let factory = self.source.get_factory(&artifact.source_path)?;
        if factory.bytecode.is_empty() {
            return Err(DeployError::InvalidPlan(format!(
                "{artifact} has no creation bytecode (abstract contract or interface?)"
            )));
        }
        Ok(factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::StaticArtifacts;

    fn factory() -> ContractFactory {
        ContractFactory::new(vec![0x60, 0x80], JsonAbi::new())
    }

    #[test]
    fn test_logical_name_of() {
        assert_eq!(logical_name_of("contracts/mocks/Token.sol:Token"), "Token");
        assert_eq!(logical_name_of("Token"), "Token");
    }

    fn source() -> StaticArtifacts {
        StaticArtifacts::default()
            .with_contract("contracts/USDC.sol:USDC", factory())
            .with_contract("contracts/mocks/Token.sol:Token", factory())
            .with_contract("contracts/Token.sol:Token", factory())
            .with_contract(
                "contracts/Abstract.sol:Abstract",
                ContractFactory::new(Bytes::new(), JsonAbi::new()),
            )
    }

    #[test]
    fn test_resolve_unique_name() {
        let resolver = ArtifactResolver::new(source());
        let artifact = resolver.resolve("USDC", None).expect("USDC should resolve");
        assert_eq!(artifact, ArtifactRef::new("USDC", "contracts/USDC.sol:USDC"));
    }

    #[test]
    fn test_resolve_missing_name() {
        let resolver = ArtifactResolver::new(source());
        let err = resolver.resolve("Nope", None).unwrap_err();
        assert!(matches!(err, DeployError::ArtifactNotFound(name) if name == "Nope"));
    }

    #[test]
    fn test_resolve_ambiguous_name_requires_source_path() {
        let resolver = ArtifactResolver::new(source());

        let err = resolver.resolve("Token", None).unwrap_err();
        match err {
            DeployError::AmbiguousArtifact { name, candidates } => {
                assert_eq!(name, "Token");
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected an ambiguous artifact, got {other:?}"),
        }

        let artifact = resolver
            .resolve("Token", Some("contracts/Token.sol:Token"))
            .expect("explicit source path should disambiguate");
        assert_eq!(artifact.source_path, "contracts/Token.sol:Token");
    }

    #[test]
    fn test_resolve_unknown_source_path() {
        let resolver = ArtifactResolver::new(source());
        let err = resolver
            .resolve("Token", Some("contracts/Other.sol:Token"))
            .unwrap_err();
        assert!(matches!(err, DeployError::ArtifactNotFound(_)));
    }

    #[test]
    fn test_factory_rejects_empty_bytecode() {
        let resolver = ArtifactResolver::new(source());
        let artifact = resolver.resolve("Abstract", None).expect("should resolve");
        assert!(matches!(
            resolver.factory(&artifact),
            Err(DeployError::InvalidPlan(_))
        ));
    }
}
