//! Resources shared by every mode of one stack instance.

use crate::config::LoraConfig;
use crate::nvm::NvmStore;
use crate::sync_pool::SyncPool;
use std::sync::Arc;
use tokio::runtime::Handle;

#[derive(Clone)]
pub struct StackContext {
    pub config: LoraConfig,
    pub sync: Arc<SyncPool>,
    pub store: Arc<NvmStore>,
    /// Runtime the timers are scheduled on.
    pub runtime: Handle,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::nvm::MemStorage;
    use std::sync::OnceLock;
    use tokio::runtime::{Builder, Runtime};

    fn runtime() -> &'static Runtime {
        static RUNTIME: OnceLock<Runtime> = OnceLock::new();
        RUNTIME.get_or_init(|| {
            Builder::new_multi_thread()
                .worker_threads(2)
                .enable_time()
                .build()
                .expect("test runtime")
        })
    }

    /// Context over in-memory storage; the storage handle inspects writes.
    pub(crate) fn context() -> (StackContext, MemStorage) {
        context_with(LoraConfig::default())
    }

    pub(crate) fn context_with(config: LoraConfig) -> (StackContext, MemStorage) {
        let storage = MemStorage::new();
        let ctx = StackContext {
            sync: Arc::new(SyncPool::new(config.sync_pool_size)),
            store: Arc::new(NvmStore::new(Box::new(storage.clone()))),
            runtime: runtime().handle().clone(),
            config,
        };
        (ctx, storage)
    }
}
