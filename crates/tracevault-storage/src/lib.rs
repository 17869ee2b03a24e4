mod fjall_provider;
mod fjall_registry;
pub mod memory;

pub use fjall_provider::FjallObjectProvider;
pub use fjall_registry::FjallRegistryStore;
pub use memory::{MemoryProvider, MemoryRegistryStore};
