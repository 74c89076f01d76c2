pub mod engine;
pub mod filter;
pub mod memory;
pub mod pipeline;

pub use engine::{Connector, FindQuery, StoreConnection, UpdateResult, validate_collection_name};
pub use filter::SortOrder;
pub use memory::{MemoryConnection, MemoryStore, MemoryStoreStats, StoreOp};
