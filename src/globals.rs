/// Allocation granularity of every heap region.
pub const CHUNK_SIZE: usize = 32;
/// Bitmap id stamped on the chunks a region's own header and bitmap occupy.
pub const RESERVED_CHUNK_ID: u8 = 5;
/// Bitmap value of a free chunk.
pub const FREE_CHUNK_ID: u8 = 0;
/// Granularity of the page provider.
pub const PAGE_SIZE: usize = 4 * 1024;
/// Size of the first region a fresh context grows by.
pub const INITIAL_EXPANSION_SIZE: usize = 40 * 1024;
/// Size of every later region.
pub const EXPANSION_SIZE: usize = 1024 * 1024;
/// Stride of a reference stored in a field or array slot.
pub const REFERENCE_SIZE: usize = core::mem::size_of::<usize>();
