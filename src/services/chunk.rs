//! Fixed-size batching of same-stream records.

use std::slice::Chunks;

use crate::error::SyncError;

/// Split `items` into contiguous batches of `size`, the last holding the remainder.
///
/// The returned iterator borrows `items` and never reorders it; clone it to
/// iterate again from the start. Empty input yields no batches.
pub fn chunk<T>(items: &[T], size: usize) -> Result<Chunks<'_, T>, SyncError> {
    if size == 0 {
        return Err(SyncError::InvalidArgument(
            "chunk size must be positive".to_string(),
        ));
    }
    Ok(items.chunks(size))
}
