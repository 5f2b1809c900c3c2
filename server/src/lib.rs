#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod config;
pub mod error;
pub mod storage;
pub mod store;
pub mod transfer;

use std::sync::Arc;

use tokio::sync::OnceCell;

use config::Config;
use error::ServerResult;
use storage::StorageRegistry;
use store::PackageStore;

pub type State = Arc<StateInner>;

/// Global state.
#[derive(Debug)]
pub struct StateInner {
    /// The configuration.
    config: Config,

    /// The package records.
    store: PackageStore,

    /// Handles to the storage backends.
    storages: OnceCell<StorageRegistry>,
}

impl StateInner {
    pub async fn new(config: Config) -> State {
        let store = PackageStore::new(config.store_path.clone());

        Arc::new(Self {
            config,
            store,
            storages: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &PackageStore {
        &self.store
    }

    /// Returns the storage backends, creating them on first use.
    pub async fn storages(&self) -> ServerResult<&StorageRegistry> {
        self.storages
            .get_or_try_init(|| StorageRegistry::from_config(&self.config.storages))
            .await
    }

    /// Uses prepared backends instead of the configured ones.
    pub fn with_storages(config: Config, storages: StorageRegistry) -> State {
        let store = PackageStore::new(config.store_path.clone());

        Arc::new(Self {
            config,
            store,
            storages: OnceCell::new_with(Some(storages)),
        })
    }
}
