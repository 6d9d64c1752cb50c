//! Splitting large deltas into bounded parts.

/// One part of a split delta.
#[derive(Debug, Clone, PartialEq)]
pub struct Part<T, D> {
    pub updated: Vec<T>,
    pub deleted: Vec<D>,
    pub part: u32,
    pub partial: bool,
}

/// Split `updated` into parts of at most `size` items.
///
/// A set that fits is returned whole as part 0 carrying the caller's
/// `partial` flag. Larger sets count down from `n - 1` to 0: `deleted` rides
/// on the first (highest) part only, and every part but the last is marked
/// partial.
pub fn split<T, D>(updated: Vec<T>, deleted: Vec<D>, size: usize, partial: bool) -> Vec<Part<T, D>> {
    let size = size.max(1);
    if updated.len() <= size {
        return vec![Part {
            updated,
            deleted,
            part: 0,
            partial,
        }];
    }

    let count = updated.len().div_ceil(size);
    let mut parts = Vec::with_capacity(count);
    let mut deleted = Some(deleted);
    let mut items = updated.into_iter();
    for index in (0..count).rev() {
        let chunk: Vec<T> = items.by_ref().take(size).collect();
        parts.push(Part {
            updated: chunk,
            deleted: deleted.take().unwrap_or_default(),
            part: index as u32,
            partial: index > 0 || partial,
        });
    }
    parts
}
