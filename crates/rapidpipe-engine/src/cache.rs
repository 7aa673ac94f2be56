//! Registry of materialized intermediate results.
//!
//! Each pipe operation registers its materialized per-partition results
//! under the [`ExecutionContext`] it ran in. Entries live until they are
//! explicitly invalidated for that context.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

static SHARED_REGISTRY: LazyLock<Arc<CacheRegistry>> =
    LazyLock::new(|| Arc::new(CacheRegistry::default()));

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Scope that owns cache entries. Every context gets a fresh id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    id: ContextId,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

type CachedData = Arc<dyn Any + Send + Sync>;

struct CacheEntry {
    context: ContextId,
    label: String,
    partitions: usize,
    data: CachedData,
}

/// Summary of one registered entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    pub context: ContextId,
    pub label: String,
    pub partitions: usize,
}

/// Mutex-guarded list of materialized results.
#[derive(Default)]
pub struct CacheRegistry {
    entries: Mutex<Vec<CacheEntry>>,
}

impl CacheRegistry {
    /// Process-wide registry.
    pub fn shared() -> Arc<CacheRegistry> {
        Arc::clone(&SHARED_REGISTRY)
    }

    /// Register `data` under `context`.
    pub fn register<T: Any + Send + Sync>(
        &self,
        context: &ExecutionContext,
        label: impl Into<String>,
        partitions: usize,
        data: Arc<T>,
    ) {
        let label = label.into();
        tracing::debug!(context = %context.id, label = %label, partitions, "Registered materialized result");
        self.lock().push(CacheEntry {
            context: context.id,
            label,
            partitions,
            data,
        });
    }

    /// Most recent entry registered under `context` with `label`, if it holds a `T`.
    pub fn get<T: Any + Send + Sync>(&self, context: &ExecutionContext, label: &str) -> Option<Arc<T>> {
        let data = self
            .lock()
            .iter()
            .rev()
            .find(|e| e.context == context.id && e.label == label)
            .map(|e| Arc::clone(&e.data))?;
        data.downcast::<T>().ok()
    }

    /// Drop every entry of `context`. Returns the number removed.
    pub fn invalidate(&self, context: &ExecutionContext) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.context != context.id);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!(context = %context.id, removed, "Unpersisted cached results");
        }
        removed
    }

    pub fn entries(&self, context: &ExecutionContext) -> Vec<CacheEntryInfo> {
        self.lock()
            .iter()
            .filter(|e| e.context == context.id)
            .map(|e| CacheEntryInfo {
                context: e.context,
                label: e.label.clone(),
                partitions: e.partitions,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
