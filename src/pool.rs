//! The bounded, thread-cached pool of reusable operation descriptors.
//!
//! Mirrors the origin system's mempool: a process-wide bounded pool backs a
//! small LIFO cache per thread, so the hot path (acquire/release) never
//! touches cross-thread synchronization unless the local cache is empty or
//! full.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Kind};

/// Configuration for the I/O pool.
///
/// `pool_size` must be at least `cache_size * (threads + 1)`; this is
/// checked at construction time rather than discovered as a runtime
/// exhaustion failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub pool_size: u32,
    pub cache_size: u32,
}

impl PoolOptions {
    /// Validates `pool_size >= cache_size * (threads + 1)`.
    pub fn validate(&self, threads: u32) -> Result<(), Error> {
        let required = (self.cache_size as u64) * (threads as u64 + 1);
        if (self.pool_size as u64) < required {
            return Err(Error::new(Kind::Invalid).context(format!(
                "pool_size {} must be >= cache_size {} * (threads {} + 1)",
                self.pool_size, self.cache_size, threads
            )));
        }
        Ok(())
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        // Matches the origin system's SPDK_FSDEV_IO_POOL_SIZE/CACHE_SIZE defaults.
        PoolOptions {
            pool_size: 4096,
            cache_size: 64,
        }
    }
}

struct Inner<T> {
    global: Mutex<Vec<T>>,
    cache_size: usize,
    make: Box<dyn Fn() -> T + Send + Sync>,
}

thread_local! {
    static THREAD_CACHES: RefCell<Vec<(usize, Box<dyn std::any::Any>)>> = const { RefCell::new(Vec::new()) };
}

/// A process-wide bounded pool of `T`, with a per-thread LIFO cache.
///
/// `T` is typically an [`crate::ops::OperationDescriptor`] scratch buffer;
/// the pool itself is type-erased over the factory so it can be reused for
/// the dispatcher's own `FuseIO` pool (§4.4 step 1).
pub struct Pool<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    id: usize,
}

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
            id: self.id,
        }
    }
}

static NEXT_POOL_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

impl<T: Send + 'static> Pool<T> {
    /// Creates a pool pre-populated to `opts.pool_size` using `make` to
    /// construct each slot.
    pub fn new(opts: PoolOptions, make: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let mut global = Vec::with_capacity(opts.pool_size as usize);
        for _ in 0..opts.pool_size {
            global.push(make());
        }
        let id = NEXT_POOL_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Pool {
            inner: Arc::new(Inner {
                global: Mutex::new(global),
                cache_size: opts.cache_size as usize,
                make: Box::new(make),
            }),
            id,
        }
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        THREAD_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            let slot = caches.iter_mut().find(|(id, _)| *id == self.id);
            let slot = match slot {
                Some((_, any)) => any,
                None => {
                    caches.push((self.id, Box::new(Vec::<T>::new())));
                    &mut caches.last_mut().unwrap().1
                }
            };
            let cache = slot.downcast_mut::<Vec<T>>().expect("pool id collision");
            f(cache)
        })
    }

    /// Acquires a descriptor, returning [`Kind::NoBuffers`] if the pool is
    /// exhausted. Resource exhaustion is a retryable signal, not fatal.
    pub fn acquire(&self) -> Result<Pooled<T>, Error> {
        if let Some(item) = self.with_cache(|cache| cache.pop()) {
            return Ok(Pooled {
                pool: self.clone(),
                item: Some(item),
            });
        }
        let mut global = self.inner.global.lock();
        match global.pop() {
            Some(item) => Ok(Pooled {
                pool: self.clone(),
                item: Some(item),
            }),
            None => Err(Error::new(Kind::NoBuffers)),
        }
    }

    fn release(&self, item: T) {
        let overflow = self.with_cache(|cache| {
            if cache.len() < self.inner.cache_size {
                cache.push(item);
                None
            } else {
                Some(item)
            }
        });
        if let Some(item) = overflow {
            self.inner.global.lock().push(item);
        }
    }

    /// Constructs one fresh `T`, bypassing the pool. Used when the caller
    /// needs a scratch value without participating in acquire/release
    /// accounting (e.g. tests).
    pub fn make_one(&self) -> T {
        (self.inner.make)()
    }
}

/// RAII guard returned by [`Pool::acquire`].
///
/// Dropping it returns the descriptor to the owning thread's cache (or the
/// global pool, if the cache is full) on every exit path, including
/// `?`-propagated errors — this is the crate's expression of the source's
/// `defer`/scoped-release idiom.
pub struct Pooled<T: Send + 'static> {
    pool: Pool<T>,
    item: Option<T>,
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().expect("item taken before drop")
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("item taken before drop")
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validate_rejects_undersized_pool() {
        let opts = PoolOptions {
            pool_size: 10,
            cache_size: 4,
        };
        // 4 * (2 + 1) = 12 > 10
        assert!(opts.validate(2).is_err());
    }

    #[test]
    fn validate_accepts_exact_fit() {
        let opts = PoolOptions {
            pool_size: 12,
            cache_size: 4,
        };
        assert!(opts.validate(2).is_ok());
    }

    #[test]
    fn acquire_release_round_trips() {
        let pool: Pool<u32> = Pool::new(
            PoolOptions {
                pool_size: 2,
                cache_size: 1,
            },
            || 0,
        );
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
        drop(a);
        drop(b);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn exhaustion_is_no_buffers() {
        let pool: Pool<u32> = Pool::new(
            PoolOptions {
                pool_size: 0,
                cache_size: 0,
            },
            || 0,
        );
        let err = pool.acquire().unwrap_err();
        assert_eq!(err.kind(), Kind::NoBuffers);
    }
}
