mod arena;
#[allow(clippy::module_inception)]
mod skiplist;

pub use arena::Arena;
pub use skiplist::{SkipList, SkipListIter};
