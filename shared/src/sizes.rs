pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;

pub const SECTOR_SIZE: usize = 512;

/// Geometry of the persistent swap area: 8192 sectors = 4 MB = 1024 pages.
pub const SWAP_SECTORS: usize = 8192;
pub const SWAP_SIZE: usize = SECTOR_SIZE * SWAP_SECTORS;
pub const SWAP_SLOTS: usize = SWAP_SIZE / crate::mem::PAGE_FRAME_SIZE;
