//! Lookup of authentication secrets by peer name.

use std::collections::HashMap;

use serde::Deserialize;

use crate::{Error, Result};

/// A source of per-peer authentication secrets, consulted when acting
/// as the authenticator.
pub trait SecretStore {
    fn lookup(&self, peer_name: &str) -> Result<Vec<u8>>;
}

/// A secret store backed by a JSON file mapping peer names to secrets.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct FileSecrets {
    secrets: HashMap<String, String>,
}

impl FileSecrets {
    /// Reads and parses a secrets file.
    pub async fn load(path: &str) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl SecretStore for FileSecrets {
    fn lookup(&self, peer_name: &str) -> Result<Vec<u8>> {
        self.secrets
            .get(peer_name)
            .map(|secret| secret.as_bytes().to_vec())
            .ok_or_else(|| Error::NoSecret(peer_name.to_string()))
    }
}

impl SecretStore for HashMap<String, Vec<u8>> {
    fn lookup(&self, peer_name: &str) -> Result<Vec<u8>> {
        self.get(peer_name)
            .cloned()
            .ok_or_else(|| Error::NoSecret(peer_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_secrets_json() {
        let store: FileSecrets =
            serde_json::from_str(r#"{"secrets":{"alice":"hunter2"}}"#).unwrap();

        assert_eq!(store.lookup("alice").unwrap(), b"hunter2".to_vec());
        assert!(matches!(store.lookup("bob"), Err(Error::NoSecret(_))));
    }

    #[test]
    fn map_store_returns_missing_peer_error() {
        let mut store = HashMap::new();
        store.insert("alice".to_string(), b"hunter2".to_vec());

        assert_eq!(store.lookup("alice").unwrap(), b"hunter2".to_vec());
        assert!(store.lookup("mallory").is_err());
    }
}
