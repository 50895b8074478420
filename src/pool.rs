//! Size-classed fragment free lists feeding the allocation fast paths.

use std::sync::Mutex;

use crate::config::TransportConfig;
use crate::frag::{FragClass, Fragment};
use crate::logging::{self, Logger};
use crate::support::{ErrorType, TransportError, TransportResult};

struct FreeListInner {
    free: Vec<Box<Fragment>>,
    allocated: usize,
}

/// A mutex-guarded free list of fragments of one size class, grown by
/// `inc` up to `max` (0 = unbounded).
pub struct FreeList {
    class: FragClass,
    capacity: usize,
    max: usize,
    inc: usize,
    inner: Mutex<FreeListInner>,
    log: Logger,
}

impl FreeList {
    pub fn new(
        class: FragClass,
        capacity: usize,
        num: usize,
        max: usize,
        inc: usize,
        log: Logger,
    ) -> FreeList {
        let mut free = Vec::with_capacity(num);
        for _ in 0..num {
            free.push(Box::new(Fragment::new(class, capacity)));
        }

        FreeList {
            class,
            capacity,
            max,
            inc,
            inner: Mutex::new(FreeListInner {
                free,
                allocated: num,
            }),
            log,
        }
    }

    #[inline]
    pub fn class(&self) -> FragClass {
        self.class
    }

    /// Pop a fragment, growing the list when empty and the configured
    /// maximum allows it.
    pub fn alloc(&self) -> TransportResult<Box<Fragment>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(frag) = inner.free.pop() {
            return Ok(frag);
        }

        if self.max != 0 && inner.allocated >= self.max {
            return Err(TransportError::Fatal(ErrorType::Exhausted));
        }

        let headroom = match self.max {
            0 => self.inc,
            max => self.inc.min(max - inner.allocated),
        }
        .max(1);

        for _ in 1..headroom {
            inner.free.push(Box::new(Fragment::new(self.class, self.capacity)));
        }
        inner.allocated += headroom;

        logging::debug!(self.log, "free list grown";
                        "context" => "alloc",
                        "class" => ?self.class,
                        "allocated" => inner.allocated);

        Ok(Box::new(Fragment::new(self.class, self.capacity)))
    }

    /// Return a fragment to the list it was allocated from.
    pub fn release(&self, mut frag: Box<Fragment>) {
        if frag.class != self.class {
            panic!(
                "Fragment of class {:?} returned to the {:?} list",
                frag.class, self.class
            );
        }
        frag.reset();
        self.inner.lock().unwrap().free.push(frag);
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    #[cfg(test)]
    fn allocated(&self) -> usize {
        self.inner.lock().unwrap().allocated
    }
}

/// The three process-wide fragment pools.
pub struct FragPools {
    pub eager: FreeList,
    pub max: FreeList,
    pub user: FreeList,
    eager_limit: usize,
    max_send_size: usize,
}

impl FragPools {
    pub fn new(config: &TransportConfig, log: &Logger) -> FragPools {
        FragPools {
            eager: FreeList::new(
                FragClass::Eager,
                config.eager_limit,
                config.free_list_num,
                config.free_list_max,
                config.free_list_inc,
                log.new(logging::o!("pool" => "eager")),
            ),
            max: FreeList::new(
                FragClass::Max,
                config.max_send_size,
                config.free_list_num,
                config.free_list_max,
                config.free_list_inc,
                log.new(logging::o!("pool" => "max")),
            ),
            user: FreeList::new(
                FragClass::User,
                0,
                config.free_list_num,
                config.free_list_max,
                config.free_list_inc,
                log.new(logging::o!("pool" => "user")),
            ),
            eager_limit: config.eager_limit,
            max_send_size: config.max_send_size,
        }
    }

    #[inline]
    pub fn eager_limit(&self) -> usize {
        self.eager_limit
    }

    #[inline]
    pub fn max_send_size(&self) -> usize {
        self.max_send_size
    }

    /// Allocate a fragment whose inline space covers `size` bytes, choosing
    /// the smallest sufficient class. Sizes beyond the maximum send size are
    /// refused here, at the allocation boundary.
    pub fn alloc_for_size(&self, size: usize) -> TransportResult<Box<Fragment>> {
        if size <= self.eager_limit {
            self.eager.alloc()
        } else if size <= self.max_send_size {
            self.max.alloc()
        } else {
            Err(TransportError::Fatal(ErrorType::PayloadTooLarge))
        }
    }

    /// Route a fragment back to its origin list.
    pub fn release(&self, frag: Box<Fragment>) {
        match frag.class {
            FragClass::Eager => self.eager.release(frag),
            FragClass::Max => self.max.release(frag),
            FragClass::User => self.user.release(frag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TransportConfig {
        let mut config = TransportConfig::default();
        config.free_list_num = 2;
        config.free_list_max = 4;
        config.free_list_inc = 2;
        config.eager_limit = 128;
        config.max_send_size = 1024;
        config
    }

    #[test]
    fn test_class_selection() {
        let pools = FragPools::new(&test_config(), &logging::discard());

        assert_eq!(pools.alloc_for_size(0).unwrap().class, FragClass::Eager);
        assert_eq!(pools.alloc_for_size(128).unwrap().class, FragClass::Eager);
        assert_eq!(pools.alloc_for_size(129).unwrap().class, FragClass::Max);
        assert_eq!(pools.alloc_for_size(1024).unwrap().class, FragClass::Max);
        assert_eq!(
            pools.alloc_for_size(1025).unwrap_err(),
            TransportError::Fatal(ErrorType::PayloadTooLarge)
        );
    }

    #[test]
    fn test_release_returns_to_origin_list() {
        let pools = FragPools::new(&test_config(), &logging::discard());

        let frag = pools.alloc_for_size(64).unwrap();
        assert_eq!(pools.eager.idle(), 1);

        pools.release(frag);
        assert_eq!(pools.eager.idle(), 2);
        assert_eq!(pools.max.idle(), 2);
    }

    #[test]
    fn test_growth_and_exhaustion() {
        let pools = FragPools::new(&test_config(), &logging::discard());

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pools.eager.alloc().unwrap());
        }

        assert_eq!(pools.eager.allocated(), 4);
        assert_eq!(
            pools.eager.alloc().unwrap_err(),
            TransportError::Fatal(ErrorType::Exhausted)
        );

        pools.eager.release(held.pop().unwrap());
        assert!(pools.eager.alloc().is_ok());
    }

    #[test]
    fn test_unbounded_growth() {
        let mut config = test_config();
        config.free_list_max = 0;
        let pools = FragPools::new(&config, &logging::discard());

        let mut held = Vec::new();
        for _ in 0..32 {
            held.push(pools.user.alloc().unwrap());
        }
        assert!(pools.user.allocated() >= 32);
    }

    #[test]
    #[should_panic(expected = "returned to")]
    fn test_cross_class_release_panics() {
        let pools = FragPools::new(&test_config(), &logging::discard());
        let frag = pools.eager.alloc().unwrap();
        pools.max.release(frag);
    }

    #[test]
    fn test_released_fragment_is_reset() {
        let pools = FragPools::new(&test_config(), &logging::discard());

        let mut frag = pools.eager.alloc().unwrap();
        frag.set_inline_src(16);
        frag.payload_mut().copy_from_slice(&[9; 16]);
        frag.setup_send(3);
        pools.release(frag);

        let frag = pools.eager.alloc().unwrap();
        assert_eq!(frag.iov_cnt(), 0);
        assert_eq!(frag.tag, 0);
        assert!(frag.payload().is_empty());
    }
}
