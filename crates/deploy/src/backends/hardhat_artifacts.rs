//! Hardhat compilation artifacts on disk.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_core::{json_abi::JsonAbi, primitives::Bytes};
use anyhow::Context;
use serde::Deserialize;

use crate::{ContractFactory, DeployError, artifact::logical_name_of, traits::ArtifactSource};

/// Directory Hardhat writes solc inputs and outputs to. Not contract artifacts.
const BUILD_INFO_DIR: &str = "build-info";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactHeader {
    contract_name: String,
    source_name: String,
}

#[derive(Deserialize)]
struct ArtifactBody {
    abi: JsonAbi,
    bytecode: String,
}

/// Index of a Hardhat `artifacts/` directory.
///
/// Only the names are read up front. Bytecode and ABI are parsed when a
/// factory is requested.
#[derive(Debug, Clone)]
pub struct HardhatArtifacts {
    root: PathBuf,
    /// Fully qualified name to artifact file.
    files: BTreeMap<String, PathBuf>,
}

impl HardhatArtifacts {
    /// Scan `root` (usually `<project>/artifacts`).
    pub fn load(root: &Path) -> Result<Self, anyhow::Error> {
        let mut files = BTreeMap::new();
        scan(root, &mut files)?;

        tracing::debug!(root = %root.display(), artifacts = files.len(), "Indexed Hardhat artifacts");

        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn scan(dir: &Path, files: &mut BTreeMap<String, PathBuf>) -> Result<(), anyhow::Error> {
    let entries = std::fs::read_dir(dir)
        .context(format!("Failed to read artifacts directory {}", dir.display()))?;

    for entry in entries {
        let path = entry
            .context(format!("Failed to list {}", dir.display()))?
            .path();

        if path.is_dir() {
            if path.file_name().is_some_and(|name| name == BUILD_INFO_DIR) {
                continue;
            }
            scan(&path, files)?;
            continue;
        }

        let is_artifact = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(".json") && !name.ends_with(".dbg.json"));
        if !is_artifact {
            continue;
        }

        let content = std::fs::read_to_string(&path)
            .context(format!("Failed to read artifact {}", path.display()))?;
        // Other JSON files may live next to artifacts; skip anything that is not one.
        let Ok(header) = serde_json::from_str::<ArtifactHeader>(&content) else {
            tracing::trace!(path = %path.display(), "Skipping non-artifact JSON");
            continue;
        };

        files.insert(
            format!("{}:{}", header.source_name, header.contract_name),
            path,
        );
    }

    Ok(())
}

impl ArtifactSource for HardhatArtifacts {
    fn source_paths(&self, logical_name: &str) -> Vec<String> {
        self.files
            .keys()
            .filter(|path| logical_name_of(path) == logical_name)
            .cloned()
            .collect()
    }

    fn get_factory(&self, source_path: &str) -> Result<ContractFactory, DeployError> {
        let path = self
            .files
            .get(source_path)
            .ok_or_else(|| DeployError::ArtifactNotFound(source_path.to_string()))?;

        let invalid =
            |reason: String| DeployError::InvalidPlan(format!("artifact {source_path}: {reason}"));

        let content = std::fs::read_to_string(path)
            .map_err(|err| invalid(format!("cannot read {}: {err}", path.display())))?;
        let body: ArtifactBody =
            serde_json::from_str(&content).map_err(|err| invalid(err.to_string()))?;

        if body.bytecode.contains("__$") {
            return Err(invalid("bytecode has unlinked libraries".to_string()));
        }
        let bytecode: Bytes = body
            .bytecode
            .parse()
            .map_err(|err| invalid(format!("invalid bytecode: {err}")))?;

        Ok(ContractFactory::new(bytecode, body.abi))
    }
}
