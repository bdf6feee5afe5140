//! Command builder for `hardhat verify`.

use alloy_core::primitives::Address;

/// Builder for `npx hardhat verify` arguments.
#[derive(Debug, Clone)]
pub struct HardhatVerifyCmdBuilder {
    network: String,
    address: Address,
    contract: Option<String>,
    constructor_args: Vec<String>,
    extra_args: Vec<String>,
}

impl HardhatVerifyCmdBuilder {
    pub fn new(network: impl Into<String>, address: Address) -> Self {
        Self {
            network: network.into(),
            address,
            contract: None,
            constructor_args: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    /// Fully qualified contract name, needed when several contracts share bytecode.
    pub fn contract(mut self, source_path: impl Into<String>) -> Self {
        self.contract = Some(source_path.into());
        self
    }

    /// Positional constructor arguments.
    pub fn constructor_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.constructor_args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add extra arguments.
    pub fn extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Build the arguments passed to `npx`.
    pub fn build(self) -> Vec<String> {
        let mut cmd = vec![
            "hardhat".to_string(),
            "verify".to_string(),
            "--network".to_string(),
            self.network,
        ];

        if let Some(contract) = self.contract {
            cmd.push("--contract".to_string());
            cmd.push(contract);
        }

        cmd.extend(self.extra_args);
        cmd.push(self.address.to_string());
        cmd.extend(self.constructor_args);

        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::address;

    #[test]
    fn test_hardhat_verify_cmd_builder() {
        let address = address!("5FbDB2315678afecb367f032d93F642f64180aa3");
        let cmd = HardhatVerifyCmdBuilder::new("baseSepolia", address)
            .contract("contracts/Token.sol:Token")
            .constructor_args(["30000000000000000000", "0x036CbD53842c5426634e7929541eC2318f3dCF7e"])
            .build();

        assert_eq!(cmd[..4], ["hardhat", "verify", "--network", "baseSepolia"]);
        assert!(cmd.contains(&"--contract".to_string()));
        assert!(cmd.contains(&"contracts/Token.sol:Token".to_string()));

        // The address comes right before the constructor arguments.
        let position = cmd
            .iter()
            .position(|arg| *arg == address.to_string())
            .expect("address should be present");
        assert_eq!(cmd[position + 1], "30000000000000000000");
        assert_eq!(cmd.len(), position + 3);
    }
}
