pub mod SharedMemory;
pub mod alloc;
pub mod futex;

pub use SharedMemory::{
    attach_shared_memory, create_shared_memory, unlink_if_current, unlink_shared_memory, RawHandle,
    SharedMemoryBackend,
};
