//! Context wrappers and the registry of live contexts.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use gpuexec_core::handle::{ContextHandle, DevicePtr};

use crate::driver::Driver;

/// Zero is reserved for "no context".
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A device context known to the layer.
///
/// Wrappers are created only through [`ContextRegistry::add`], so there is at
/// most one per native handle.
pub struct Context {
    handle: ContextHandle,
    device_ordinal: i32,
    id: u64,
    driver: Arc<dyn Driver>,
    sync_around_driver_calls: bool,
}

impl Context {
    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn device_ordinal(&self) -> i32 {
        self.device_ordinal
    }

    /// Process-unique, never reused.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub(crate) fn sync_around_driver_calls(&self) -> bool {
        self.sync_around_driver_calls
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.handle)
            .field("device_ordinal", &self.device_ordinal)
            .field("id", &self.id)
            .field("backend", &self.driver.backend_name())
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    by_handle: HashMap<ContextHandle, Arc<Context>>,
    by_ordinal: HashMap<i32, Vec<ContextHandle>>,
}

/// Maps native context handles to their wrappers.
pub struct ContextRegistry {
    driver: Arc<dyn Driver>,
    sync_around_driver_calls: bool,
    inner: Mutex<RegistryInner>,
}

impl ContextRegistry {
    pub fn new(driver: Arc<dyn Driver>, sync_around_driver_calls: bool) -> Self {
        Self {
            driver,
            sync_around_driver_calls,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Returns the wrapper for `handle`, creating it on first sight.
    pub fn add(&self, handle: ContextHandle, device_ordinal: i32) -> Arc<Context> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.by_handle.get(&handle) {
            return Arc::clone(existing);
        }

        let context = Arc::new(Context {
            handle,
            device_ordinal,
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            driver: Arc::clone(&self.driver),
            sync_around_driver_calls: self.sync_around_driver_calls,
        });
        debug!(
            "registered context {} (id {}) for device {}",
            handle, context.id, device_ordinal
        );
        inner.by_handle.insert(handle, Arc::clone(&context));
        inner.by_ordinal.entry(device_ordinal).or_default().push(handle);
        context
    }

    pub fn remove(&self, handle: ContextHandle) {
        let mut inner = self.inner.lock();
        let Some(context) = inner.by_handle.remove(&handle) else {
            return;
        };
        let ordinal = context.device_ordinal;
        if let Some(handles) = inner.by_ordinal.get_mut(&ordinal) {
            handles.retain(|h| *h != handle);
            if handles.is_empty() {
                inner.by_ordinal.remove(&ordinal);
            }
        }
        debug!("unregistered context {} (id {})", handle, context.id);
    }

    pub fn has(&self, handle: ContextHandle) -> bool {
        self.inner.lock().by_handle.contains_key(&handle)
    }

    pub fn get(&self, handle: ContextHandle) -> Option<Arc<Context>> {
        self.inner.lock().by_handle.get(&handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort reverse lookup of the context owning `ptr`.
    ///
    /// Resolves the pointer's device ordinal and picks a live context on that
    /// device. Returns the null handle when nothing matches.
    pub fn get_any_context(&self, ptr: DevicePtr) -> ContextHandle {
        let inner = self.inner.lock();
        let ordinal = match self.driver.pointer_get_device_ordinal(ptr) {
            Ok(ordinal) => ordinal,
            Err(res) => {
                trace!("no device ordinal for pointer {}: {}", ptr, crate::result::to_string(res));
                return ContextHandle::null();
            }
        };
        inner
            .by_ordinal
            .get(&ordinal)
            .and_then(|handles| handles.first().copied())
            .unwrap_or_default()
    }
}
