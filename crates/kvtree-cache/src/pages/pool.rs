//! Page pool backing cached KV state
//!
//! The tree never sees physical memory. It only trades logical [`PageId`]s
//! with an allocator, which is free to map them onto device blocks however it
//! likes.

use kvtree_types::{KvTreeError, PageId, PoolConfig, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

/// Allocator contract consumed by the tree and the scheduler
pub trait PageAllocator: Send + Sync + std::fmt::Debug {
    /// Allocate `count` pages. Either all pages are returned or none are.
    fn allocate(&self, count: usize) -> Result<Vec<PageId>>;

    /// Return pages to the allocator
    fn free(&self, pages: &[PageId]) -> Result<()>;

    /// Pages that can currently be allocated
    fn available(&self) -> usize;

    /// Total pages managed by this allocator
    fn capacity(&self) -> usize;
}

#[derive(Debug)]
struct PoolState {
    /// Released pages, reused before fresh ids
    free_pages: VecDeque<PageId>,
    /// Allocation flag per page id handed out so far
    in_use: Vec<bool>,
}

/// Bounded page pool with free-list reuse
#[derive(Debug)]
pub struct PagePool {
    /// Maximum number of pages
    max_pages: usize,
    state: Mutex<PoolState>,
    /// Statistics
    allocated_pages: AtomicUsize,
    total_allocations: AtomicUsize,
    total_deallocations: AtomicUsize,
}

impl PagePool {
    /// Create new page pool
    pub fn new(max_pages: usize) -> Result<Self> {
        if max_pages == 0 {
            return Err(KvTreeError::invalid_parameter("Max pages must be positive"));
        }
        if max_pages > u32::MAX as usize {
            return Err(KvTreeError::invalid_parameter(format!(
                "Max pages {} exceeds the page id space",
                max_pages
            )));
        }

        debug!("Creating page pool: max_pages={}", max_pages);

        Ok(Self {
            max_pages,
            state: Mutex::new(PoolState {
                free_pages: VecDeque::new(),
                in_use: Vec::new(),
            }),
            allocated_pages: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
            total_deallocations: AtomicUsize::new(0),
        })
    }

    /// Create a pool sized by configuration
    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::new(config.max_pages)
    }

    /// Number of pages currently handed out
    pub fn allocated(&self) -> usize {
        self.allocated_pages.load(Ordering::Relaxed)
    }

    /// Whether a page is currently allocated
    pub fn is_allocated(&self, page: PageId) -> bool {
        let state = self.state.lock();
        state
            .in_use
            .get(page.value() as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Get statistics
    pub fn stats(&self) -> PagePoolStats {
        let allocated = self.allocated();
        PagePoolStats {
            max_pages: self.max_pages,
            allocated_pages: allocated,
            free_pages: self.max_pages - allocated,
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.total_deallocations.load(Ordering::Relaxed),
        }
    }
}

impl PageAllocator for PagePool {
    fn allocate(&self, count: usize) -> Result<Vec<PageId>> {
        let mut state = self.state.lock();
        let allocated = self.allocated_pages.load(Ordering::Relaxed);
        if allocated + count > self.max_pages {
            return Err(KvTreeError::out_of_memory(format!(
                "Page pool exhausted: requested {}, {}/{} pages allocated",
                count, allocated, self.max_pages
            )));
        }

        let mut pages = Vec::with_capacity(count);
        while pages.len() < count {
            let page = match state.free_pages.pop_front() {
                Some(page) => page,
                None => {
                    let page = PageId::new(state.in_use.len() as u32);
                    state.in_use.push(false);
                    page
                }
            };
            state.in_use[page.value() as usize] = true;
            pages.push(page);
        }

        self.allocated_pages.fetch_add(count, Ordering::Relaxed);
        self.total_allocations.fetch_add(count, Ordering::Relaxed);
        trace!("Allocated {} pages ({} in use)", count, allocated + count);

        Ok(pages)
    }

    fn free(&self, pages: &[PageId]) -> Result<()> {
        let mut state = self.state.lock();

        // Clear flags as we go; a repeated or unknown id rolls the batch back
        for (i, page) in pages.iter().enumerate() {
            let idx = page.value() as usize;
            if !state.in_use.get(idx).copied().unwrap_or(false) {
                for released in &pages[..i] {
                    state.in_use[released.value() as usize] = true;
                }
                return Err(KvTreeError::internal(format!(
                    "Freeing page {} that is not allocated",
                    page
                )));
            }
            state.in_use[idx] = false;
        }
        state.free_pages.extend(pages.iter().copied());

        self.allocated_pages.fetch_sub(pages.len(), Ordering::Relaxed);
        self.total_deallocations
            .fetch_add(pages.len(), Ordering::Relaxed);
        trace!("Freed {} pages", pages.len());

        Ok(())
    }

    fn available(&self) -> usize {
        self.max_pages - self.allocated_pages.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> usize {
        self.max_pages
    }
}

/// Page pool statistics
#[derive(Debug, Clone)]
pub struct PagePoolStats {
    pub max_pages: usize,
    pub allocated_pages: usize,
    pub free_pages: usize,
    pub total_allocations: usize,
    pub total_deallocations: usize,
}

impl PagePoolStats {
    /// Get utilization percentage
    pub fn utilization(&self) -> f32 {
        if self.max_pages == 0 {
            0.0
        } else {
            (self.allocated_pages as f32 / self.max_pages as f32) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_pool_creation() {
        let pool = PagePool::new(100).unwrap();
        assert_eq!(pool.capacity(), 100);
        assert_eq!(pool.available(), 100);
        assert!(PagePool::new(0).is_err());
    }

    #[test]
    fn test_page_allocation() {
        let pool = PagePool::new(100).unwrap();

        let pages = pool.allocate(3).unwrap();
        assert_eq!(pages, vec![PageId::new(0), PageId::new(1), PageId::new(2)]);

        let stats = pool.stats();
        assert_eq!(stats.allocated_pages, 3);
        assert_eq!(stats.free_pages, 97);
        assert!((stats.utilization() - 3.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_page_deallocation() {
        let pool = PagePool::new(100).unwrap();

        let pages = pool.allocate(2).unwrap();
        pool.free(&pages).unwrap();

        assert_eq!(pool.available(), 100);
        assert!(!pool.is_allocated(pages[0]));
        assert_eq!(pool.stats().total_deallocations, 2);
    }

    #[test]
    fn test_pool_exhaustion_is_all_or_nothing() {
        let pool = PagePool::new(4).unwrap();

        let _held = pool.allocate(3).unwrap();
        let err = pool.allocate(2).unwrap_err();
        assert!(matches!(err, KvTreeError::OutOfMemory { .. }));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_page_reuse() {
        let pool = PagePool::new(100).unwrap();

        let pages = pool.allocate(1).unwrap();
        pool.free(&pages).unwrap();

        let again = pool.allocate(1).unwrap();
        assert_eq!(again, pages);
    }

    #[test]
    fn test_double_free_rejected() {
        let pool = PagePool::new(8).unwrap();

        let pages = pool.allocate(2).unwrap();
        pool.free(&pages[..1]).unwrap();
        assert!(pool.free(&pages[..1]).is_err());
        assert!(pool.free(&[pages[1], pages[1]]).is_err());
        // The rejected batch must not have released anything
        assert!(pool.is_allocated(pages[1]));
        assert!(pool.free(&[PageId::new(99)]).is_err());
    }

    #[test]
    fn test_large_free_rolls_back_on_repeat() {
        let pool = PagePool::new(50_000).unwrap();
        let mut pages = pool.allocate(50_000).unwrap();
        pages.push(pages[0]);

        assert!(pool.free(&pages).is_err());
        assert_eq!(pool.available(), 0);
        assert!(pages.iter().all(|page| pool.is_allocated(*page)));

        pages.pop();
        pool.free(&pages).unwrap();
        assert_eq!(pool.available(), 50_000);
        assert_eq!(pool.allocate(50_000).unwrap().len(), 50_000);
    }

    #[test]
    fn test_from_config() {
        let pool = PagePool::from_config(&PoolConfig { max_pages: 12 }).unwrap();
        assert_eq!(pool.capacity(), 12);
        assert!(PagePool::from_config(&PoolConfig { max_pages: 0 }).is_err());
    }
}
