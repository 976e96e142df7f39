/// Size of an ed2k piece. Every piece except possibly the last is exactly
/// this long, and every piece gets its own MD4 digest in the hash set.
pub const PIECE_SIZE: u64 = 9_728_000;

/// Request granularity on the peer wire (180 KiB).
pub const BLOCK_SIZE: u32 = 180 * 1024;

/// Granularity of disk buffers (16 KiB).
pub const DISK_BLOCK_SIZE: u32 = 16 * 1024;

/// Client ids below this are "LowID": the server assigned them because the
/// peer cannot accept inbound connections and must be reached via callback.
pub const HIGHEST_LOWID: u32 = 16_777_216;

/// Max payload size accepted on a server connection frame.
pub const SERVER_FRAME_MAX: usize = 250_000;

pub const fn is_low_id(id: u32) -> bool {
    id < HIGHEST_LOWID
}
