use parking_lot::Mutex;
use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    sync::Arc,
};
use strata_error::{ErrorCodes, StrataError};
use thiserror::Error;

pub trait Injectable: Any + Send + Sync + Clone {}

/// Service locator for collaborators shared between pipelines, such as the
/// query cache or a memory probe.
/// ## Note
/// Values are cloned on retrieval, so store handles whose clones share state
/// (usually an `Arc<Inner>`).
#[derive(Default, Clone)]
pub struct Registry {
    storage: Arc<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Type [{0}] not found in the registry")]
    TypeNotFound(String),
}

impl StrataError for RegistryError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Internal
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Injectable>(&self, value: T) {
        let mut storage = self.storage.lock();
        storage.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Injectable>(&self) -> Result<T, RegistryError> {
        let storage = self.storage.lock();
        storage
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
            .ok_or(RegistryError::TypeNotFound(type_name::<T>().to_string()))
    }

    /// Returns the registered value, registering the one built by `init` first
    /// when the type is absent. The lock is held throughout, so concurrent
    /// callers agree on a single value. Nothing is registered if `init` fails.
    pub fn get_or_try_register_with<T: Injectable, E>(
        &self,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let mut storage = self.storage.lock();
        if let Some(existing) = storage
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
        {
            return Ok(existing.clone());
        }
        let value = init()?;
        storage.insert(TypeId::of::<T>(), Box::new(value.clone()));
        Ok(value)
    }
}
