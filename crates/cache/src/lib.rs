pub mod boundary;
pub mod completeness;
pub mod iterator;
pub mod result_cache;
pub mod visibility;

pub use boundary::{Boundary, BoundaryCache};
pub use completeness::BitmapCompletenessCache;
pub use iterator::IteratorCache;
pub use result_cache::{CheckKey, CheckResultCache, ResultCacheStats};
pub use visibility::{DirVisibilityCache, VisibilityStats};
