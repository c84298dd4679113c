pub mod coordinator;

pub use coordinator::{MemoryCoordinator, RecallConfig, RecallError};
