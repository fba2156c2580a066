mod batch_cache;

pub use batch_cache::{sha256_bytes, to_hex, BatchCache};
