pub const KB: usize = 1024;
pub const MB: usize = KB * KB;

/// Bytes per sector on every block device the kernel drives.
pub const SECTOR_SIZE: u32 = 512;
