use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Platform secret storage for the session tokens.
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, InfraError>;
    async fn set_item(&self, key: &str, value: &str) -> Result<(), InfraError>;
    async fn remove_item(&self, key: &str) -> Result<(), InfraError>;
}

/// OS keychain backed store; one keyring entry per key under a shared service name.
///
/// Backends: macOS Keychain, Windows Credential Manager, and the Linux kernel
/// keyutils keyring (session keyring, linked to the persistent one when available).
#[derive(Debug, Clone)]
pub struct KeyringSecureStore {
    service_name: String,
}

impl KeyringSecureStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, InfraError> {
        keyring::Entry::new(&self.service_name, key)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringSecureStore {
    fn default() -> Self {
        Self::new("taskpad.session")
    }
}

#[async_trait]
impl SecureStore for KeyringSecureStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, InfraError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), InfraError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    async fn remove_item(&self, key: &str) -> Result<(), InfraError> {
        match self.entry(key)?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemorySecureStore {
    items: Mutex<HashMap<String, String>>,
}

impl InMemorySecureStore {
    pub fn with_items<'a>(items: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            items: Mutex::new(
                items
                    .into_iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            ),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, InfraError> {
        self.items
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))
    }
}

#[async_trait]
impl SecureStore for InMemorySecureStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, InfraError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), InfraError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), InfraError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
