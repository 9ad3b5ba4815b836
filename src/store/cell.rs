//! A typed slot in the keyed store with update handlers.

use super::{KeyedStore, LoadWarning, StoreError};
use crate::codec::PropertyListSerializable;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type UpdateHandler<T> = Box<dyn Fn(&T) + Send + Sync>;

/// One persisted value under one key.
///
/// Every write is persisted before it returns, then each update handler is
/// called with the new value in registration order. Writers are serialized
/// by a per-cell lock that is held across read, modify, persist and notify,
/// so a handler must not write to the cell that invoked it.
pub struct DurableCell<T> {
    inner: Arc<CellInner<T>>,
}

struct CellInner<T> {
    store: KeyedStore,
    key: String,
    default: T,
    writer: Mutex<()>,
    handlers: RwLock<Vec<UpdateHandler<T>>>,
    load_warning: Option<LoadWarning>,
}

impl<T> Clone for DurableCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> DurableCell<T>
where
    T: PropertyListSerializable + Clone + Send + Sync + 'static,
{
    /// Open the cell, performing the first read.
    ///
    /// On first launch this persists `default`.
    pub fn open(store: &KeyedStore, key: impl Into<String>, default: T) -> Result<Self, StoreError> {
        let key = key.into();
        let loaded = store.read_reporting(&key, &default)?;

        Ok(Self {
            inner: Arc::new(CellInner {
                store: store.clone(),
                key,
                default,
                writer: Mutex::new(()),
                handlers: RwLock::new(Vec::new()),
                load_warning: loaded.warning,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn default_value(&self) -> &T {
        &self.inner.default
    }

    /// Recovery performed when the cell was opened, if any.
    pub fn load_warning(&self) -> Option<&LoadWarning> {
        self.inner.load_warning.as_ref()
    }

    pub fn read(&self) -> Result<T, StoreError> {
        self.inner.store.read(&self.inner.key, &self.inner.default)
    }

    pub fn write(&self, value: T) -> Result<(), StoreError> {
        self.transact(move |current| *current = value, |_, ()| ())
    }

    /// Atomically modify the stored value.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> Result<R, StoreError> {
        self.transact(mutate, |_, result| result)
    }

    /// Like [`update`](Self::update), then runs `after` with the new value
    /// once handlers have fired, still holding the writer lock.
    pub fn update_then<R>(
        &self,
        mutate: impl FnOnce(&mut T) -> R,
        after: impl FnOnce(&T, R),
    ) -> Result<(), StoreError> {
        self.transact(mutate, after)
    }

    pub fn add_update_handler(&self, handler: impl Fn(&T) + Send + Sync + 'static) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    fn transact<R, U>(
        &self,
        mutate: impl FnOnce(&mut T) -> R,
        after: impl FnOnce(&T, R) -> U,
    ) -> Result<U, StoreError> {
        let _writer = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut value = self.read()?;
        let result = mutate(&mut value);
        self.inner.store.write(&self.inner.key, &value)?;

        for handler in self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            handler(&value);
        }

        Ok(after(&value, result))
    }
}
