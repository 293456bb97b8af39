//! Content splicing for in-memory file buffers: bounded reads and the
//! read-modify-write reconstruction behind partial writes.

/// Slice `[offset, offset + length)` out of `data`, clipped to its bounds.
pub fn clip(data: &[u8], offset: u64, length: usize) -> &[u8] {
    let start = (offset.min(data.len() as u64)) as usize;
    let end = start.saturating_add(length).min(data.len());
    &data[start..end]
}

/// Rebuild file content for a write of `incoming` at `offset`: the existing
/// prefix up to `offset`, the incoming bytes, then whatever existing content
/// lies beyond the written range.
///
/// A write starting past the current end appends directly; the gap is not
/// zero-filled.
pub fn splice(existing: &[u8], offset: u64, incoming: &[u8]) -> Vec<u8> {
    let prefix = clip(existing, 0, offset.min(existing.len() as u64) as usize);
    let resume = offset.saturating_add(incoming.len() as u64);

    let mut merged = Vec::with_capacity(prefix.len() + incoming.len());
    merged.extend_from_slice(prefix);
    merged.extend_from_slice(incoming);
    if (existing.len() as u64) > resume {
        merged.extend_from_slice(&existing[resume as usize..]);
    }
    merged
}
