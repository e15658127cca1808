pub mod atomic_map;
pub mod buf;
pub mod buffer_pool;
pub mod latch;
