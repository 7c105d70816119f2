//! Process-wide table of vault instances, one per (asset, chain).

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{VaultError, VaultResult};
use crate::types::VaultKey;
use crate::vault::Vault;

#[derive(Debug, Default)]
pub struct VaultRegistry {
    vaults: DashMap<VaultKey, Arc<Vault>>,
}

impl VaultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a vault under its own key. A second vault for the same
    /// (asset, chain) is refused.
    pub fn register(&self, vault: Vault) -> VaultResult<Arc<Vault>> {
        let key = vault.key().clone();
        match self.vaults.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(VaultError::VaultExists(key)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let vault = Arc::new(vault);
                slot.insert(Arc::clone(&vault));
                tracing::info!(vault = %key, "vault registered");
                Ok(vault)
            }
        }
    }

    pub fn get(&self, key: &VaultKey) -> VaultResult<Arc<Vault>> {
        self.vaults
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| VaultError::UnknownVault(key.clone()))
    }

    pub fn remove(&self, key: &VaultKey) -> Option<Arc<Vault>> {
        self.vaults.remove(key).map(|(_, vault)| vault)
    }

    pub fn keys(&self) -> Vec<VaultKey> {
        let mut keys: Vec<VaultKey> = self.vaults.iter().map(|e| e.key().clone()).collect();
        keys.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        keys
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::error::ErrorKind;
    use crate::types::{Address, AssetId, ChainId};
    use crate::vault::VaultBuilder;

    fn vault(asset: &str, chain: u32) -> Vault {
        VaultBuilder::new(
            VaultConfig::new(AssetId::new(asset), ChainId(chain)),
            Address::parse("admin").unwrap(),
        )
        .build()
        .unwrap()
    }

    #[test]
    fn one_vault_per_asset_and_chain() {
        let registry = VaultRegistry::new();
        registry.register(vault("USDC", 1)).unwrap();
        registry.register(vault("USDC", 10)).unwrap();
        registry.register(vault("WETH", 1)).unwrap();

        let err = registry.register(vault("USDC", 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.keys()[0].to_string(), "USDC@1");
    }

    #[test]
    fn lookup_of_unknown_key_fails() {
        let registry = VaultRegistry::new();
        let key = VaultKey::new(AssetId::new("DAI"), ChainId(1));
        assert!(matches!(registry.get(&key), Err(VaultError::UnknownVault(_))));
        assert!(registry.remove(&key).is_none());
        assert!(registry.is_empty());
    }
}
