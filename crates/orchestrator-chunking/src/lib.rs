//! Chunking and batch-fetch helpers for bounded parallel execution.
//!
//! Used wherever the engine or dispatcher must turn an unbounded collection
//! into bounded batches: a dependency level's node set against `W_run`, or
//! the dispatcher's due-schedules query against its `limit`/`offset` pair.

/// Split `items` into chunks of at most `size` elements each (the last
/// chunk may be smaller). `size == 0` yields a single chunk containing
/// everything, since an unbounded chunk is the only sensible reading of
/// "no limit".
pub fn chunk<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    if size == 0 || items.is_empty() {
        return if items.is_empty() { Vec::new() } else { vec![items.to_vec()] };
    }
    items.chunks(size).map(|c| c.to_vec()).collect()
}

/// Offset/limit pagination cursor for batch-fetch queries (e.g. due
/// schedules, or run history). `next()` advances past a page that returned
/// fewer than `limit` items by signalling exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    /// Given how many items the last fetch returned, compute the next page
    /// to fetch, or `None` if that fetch was the last page.
    pub fn next(self, returned: usize) -> Option<Self> {
        if returned < self.limit {
            None
        } else {
            Some(Self { offset: self.offset + self.limit, limit: self.limit })
        }
    }
}

/// Drive a paginated fetch function to exhaustion, collecting every item.
/// `fetch(offset, limit) -> items` is expected to return fewer than `limit`
/// items only on its final page.
pub fn fetch_all<T>(limit: usize, mut fetch: impl FnMut(usize, usize) -> Vec<T>) -> Vec<T> {
    let mut out = Vec::new();
    let mut page = Page::first(limit);
    loop {
        let batch = fetch(page.offset, page.limit);
        let returned = batch.len();
        out.extend(batch);
        match page.next(returned) {
            Some(next) => page = next,
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_splits_into_bounded_batches() {
        let items: Vec<u32> = (0..10).collect();
        let chunks = chunk(&items, 3);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], vec![0, 1, 2]);
        assert_eq!(chunks[3], vec![9]);
    }

    #[test]
    fn chunk_of_empty_is_empty() {
        let items: Vec<u32> = Vec::new();
        assert!(chunk(&items, 5).is_empty());
    }

    #[test]
    fn zero_size_yields_one_chunk() {
        let items = vec![1, 2, 3];
        assert_eq!(chunk(&items, 0), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn fetch_all_pages_until_short_batch() {
        let data: Vec<u32> = (0..25).collect();
        let fetched = fetch_all(10, |offset, limit| {
            data.iter().skip(offset).take(limit).copied().collect()
        });
        assert_eq!(fetched, data);
    }
}
