pub mod mem_disk;

pub use mem_disk::MemDisk;
