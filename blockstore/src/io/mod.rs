mod block;

pub use block::BlockStorage;
