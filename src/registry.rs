//! The Fsdev Registry (§4.2): process-wide name→device lookup, descriptor
//! lifecycle, and hot-removal coordination.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::error::{Error, Kind};
use crate::fsdev::{
    Channel, Fsdev, FsdevBackend, FsdevDescriptor, FsdevDescriptorInner, FsdevStatus,
    SharedResource,
};

/// Fan-out event delivered to an open descriptor's event callback on
/// hot-removal (§4.2, §7 "Hot-removal surfaces to every open descriptor").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsdevEvent {
    Remove,
}

/// Callback invoked once per open descriptor when its fsdev is
/// unregistered or removed.
pub type EventCallback = Arc<dyn Fn(FsdevEvent) + Send + Sync>;

struct Entry {
    fsdev: Arc<Fsdev>,
}

/// The process-wide registry singleton (§9 "Global mutable state").
///
/// Guarded by one coarse `RwLock`, acquired only around O(1) list/map
/// operations, matching §5's shared-resource policy (the registry-wide
/// lock is never held across a backend call or callback invocation).
pub struct FsdevRegistry {
    devices: RwLock<BTreeMap<String, Entry>>,
}

static REGISTRY: OnceLock<FsdevRegistry> = OnceLock::new();

impl FsdevRegistry {
    /// Returns the process-wide singleton, initializing it on first call.
    pub fn global() -> &'static FsdevRegistry {
        REGISTRY.get_or_init(|| FsdevRegistry {
            devices: RwLock::new(BTreeMap::new()),
        })
    }

    /// Tears down every registered fsdev. Provided for orderly shutdown in
    /// long-running hosts and tests, since Rust doesn't need an explicit
    /// `finish()` to reclaim the singleton itself (§9).
    pub fn shutdown(&self) {
        self.devices.write().clear();
    }

    /// Registers a new fsdev. Fails with `Invalid` on an empty name,
    /// `Exists` on a duplicate.
    pub fn register(
        &self,
        name: impl Into<String>,
        module_name: &'static str,
        backend: Arc<dyn FsdevBackend>,
    ) -> Result<Arc<Fsdev>, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::new(Kind::Invalid).context("fsdev name must not be empty"));
        }
        let mut devices = self.devices.write();
        if devices.contains_key(&name) {
            return Err(Error::new(Kind::Exists).context(format!("fsdev {name:?} already registered")));
        }
        let fsdev = Arc::new(Fsdev {
            name: name.clone(),
            backend,
            module_name,
            status: parking_lot::Mutex::new(FsdevStatus::Ready),
            open_descriptors: parking_lot::Mutex::new(Vec::new()),
        });
        devices.insert(name, Entry {
            fsdev: Arc::clone(&fsdev),
        });
        log::debug!("fsdev {:?} registered", fsdev.name);
        Ok(fsdev)
    }

    /// Opens a descriptor against a named fsdev. Fails with `NoDevice` if
    /// the name is unknown, or the device isn't `Ready`.
    pub fn open(
        &self,
        name: &str,
        event_cb: EventCallback,
    ) -> Result<FsdevDescriptor, Error> {
        let devices = self.devices.read();
        let entry = devices
            .get(name)
            .ok_or_else(|| Error::new(Kind::NoDevice).context(format!("no fsdev named {name:?}")))?;
        if *entry.fsdev.status.lock() != FsdevStatus::Ready {
            return Err(Error::new(Kind::NoDevice).context(format!("fsdev {name:?} not ready")));
        }
        let inner = Arc::new(FsdevDescriptorInner {
            fsdev: Arc::clone(&entry.fsdev),
            closed: parking_lot::Mutex::new(false),
            refcount: std::sync::atomic::AtomicU64::new(1),
            event_cb,
        });
        entry
            .fsdev
            .open_descriptors
            .lock()
            .push(Arc::clone(&inner));
        log::debug!("fsdev {:?} opened", name);
        Ok(FsdevDescriptor { inner })
    }

    /// Closes a previously opened descriptor. The descriptor is only
    /// actually freed once its refcount (bumped by in-flight removal
    /// notifications) reaches zero. If this was the last open descriptor
    /// and the fsdev is `Removing`, triggers `destruct` (§4.2).
    pub async fn close(&self, descriptor: FsdevDescriptor) {
        let inner = descriptor.inner;
        *inner.closed.lock() = true;
        let fsdev = Arc::clone(&inner.fsdev);
        let mut list = fsdev.open_descriptors.lock();
        list.retain(|d| !Arc::ptr_eq(d, &inner));
        let should_destruct = list.is_empty()
            && *fsdev.status.lock() == FsdevStatus::Removing
            && inner.refcount.load(Ordering::Acquire) == 1;
        drop(list);
        if should_destruct {
            log::debug!("fsdev {:?} destructing after last close", fsdev.name);
            if let Err(err) = fsdev.backend.destruct().await {
                log::warn!("fsdev {:?} destruct failed: {err}", fsdev.name);
            }
        }
    }

    /// Begins teardown of `fsdev`: marks it `Unregistering`, fans a
    /// `Remove` event out to every open descriptor (§7 "Hot-removal
    /// surfaces to every open descriptor as a single REMOVE event"), then
    /// transitions to `Removing` and removes it from the name table.
    /// `destruct` runs immediately if no descriptor was ever open, or is
    /// deferred to [`Self::close`] on the last close otherwise.
    pub async fn unregister(&self, fsdev: &Arc<Fsdev>) -> Result<(), Error> {
        {
            let mut status = fsdev.status.lock();
            if *status == FsdevStatus::Unregistering || *status == FsdevStatus::Removing {
                return Err(Error::new(Kind::Busy).context("fsdev already unregistering"));
            }
            *status = FsdevStatus::Unregistering;
        }
        log::debug!("fsdev {:?} unregistering", fsdev.name);
        self.devices.write().remove(&fsdev.name);

        // Bump each descriptor's refcount around its callback so a close()
        // triggered synchronously from inside the callback can't free the
        // descriptor out from under this loop (§4.2).
        let descriptors = fsdev.open_descriptors.lock().clone();
        for descriptor in &descriptors {
            descriptor.refcount.fetch_add(1, Ordering::AcqRel);
            (descriptor.event_cb)(FsdevEvent::Remove);
            descriptor.refcount.fetch_sub(1, Ordering::AcqRel);
        }

        *fsdev.status.lock() = FsdevStatus::Removing;

        if fsdev.open_descriptors.lock().is_empty() {
            log::debug!("fsdev {:?} destructing: no descriptors open", fsdev.name);
            if let Err(err) = fsdev.backend.destruct().await {
                log::warn!("fsdev {:?} destruct failed: {err}", fsdev.name);
            }
        }
        Ok(())
    }

    /// Like [`Self::unregister`] but by name, additionally verifying the
    /// device's owning module matches.
    pub async fn unregister_by_name(
        &self,
        name: &str,
        module_name: &'static str,
    ) -> Result<(), Error> {
        let fsdev = {
            let devices = self.devices.read();
            let entry = devices
                .get(name)
                .ok_or_else(|| Error::new(Kind::NoDevice))?;
            if entry.fsdev.module_name != module_name {
                return Err(Error::new(Kind::Invalid)
                    .context(format!("fsdev {name:?} not owned by module {module_name}")));
            }
            Arc::clone(&entry.fsdev)
        };
        self.unregister(&fsdev).await
    }

    /// Acquires a per-thread [`Channel`] for `descriptor`, coalescing with
    /// any existing [`SharedResource`] on the same backend channel.
    pub async fn get_io_channel(&self, descriptor: &FsdevDescriptor) -> Result<Channel, Error> {
        let fsdev = Arc::clone(&descriptor.inner.fsdev);
        let shared = fsdev.backend.get_io_channel().await?;
        Ok(Channel::new(fsdev, shared))
    }

    /// Looks up a registered fsdev by name without opening a descriptor.
    pub fn lookup(&self, name: &str) -> Option<Arc<Fsdev>> {
        self.devices.read().get(name).map(|e| Arc::clone(&e.fsdev))
    }
}

impl std::fmt::Debug for FsdevRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsdevRegistry")
            .field("devices", &self.devices.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builds a fresh [`Arc<SharedResource>`] tagged with a backend-channel
/// identity; used by backend [`FsdevBackend::get_io_channel`]
/// implementations that don't need real coalescing (e.g. the in-memory
/// demo backend).
pub fn new_shared_resource(backend_channel_id: u64) -> Arc<SharedResource> {
    Arc::new(SharedResource {
        backend_channel_id,
        refcount: std::sync::atomic::AtomicU64::new(0),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::{Operation, OperationOutput};
    use async_trait::async_trait;

    struct NoopBackend;

    #[async_trait]
    impl FsdevBackend for NoopBackend {
        async fn submit(
            &self,
            _channel: &Channel,
            _unique: crate::fsdev::RequestId,
            _op: Operation,
        ) -> Result<OperationOutput, Error> {
            Err(Kind::NotSupported.into())
        }

        async fn get_io_channel(&self) -> Result<Arc<SharedResource>, Error> {
            Ok(new_shared_resource(1))
        }
    }

    #[test]
    fn register_rejects_empty_name() {
        let registry = FsdevRegistry::global();
        let err = registry
            .register("", "test", Arc::new(NoopBackend))
            .unwrap_err();
        assert_eq!(err.kind(), Kind::Invalid);
    }

    #[test]
    fn register_rejects_duplicate_name() {
        let registry = FsdevRegistry::global();
        let name = "dup-test-fsdev";
        registry.register(name, "test", Arc::new(NoopBackend)).unwrap();
        let err = registry
            .register(name, "test", Arc::new(NoopBackend))
            .unwrap_err();
        assert_eq!(err.kind(), Kind::Exists);
        registry.devices.write().remove(name);
    }

    #[test]
    fn open_unknown_name_is_no_device() {
        let registry = FsdevRegistry::global();
        let err = registry
            .open("does-not-exist", Arc::new(|_| {}))
            .unwrap_err();
        assert_eq!(err.kind(), Kind::NoDevice);
    }
}
