pub mod position_map;

pub use position_map::{FileOblivious, MemoryOblivious, ObliviousState, ObliviousStorage, StashEntry};
