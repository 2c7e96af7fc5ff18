pub mod pool;

pub use pool::{PageAllocator, PagePool, PagePoolStats};
