//! Page bookkeeping for the virtualized table.
//!
//! The grid reports a visible rectangle at high frequency while scrolling;
//! `visible_pages` turns it into the pages that must be resident and `Pages`
//! remembers which of them are already requested or loaded.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Binary search over an ascending slice. Returns the index of `target`.
pub fn sorted_search<T: Ord>(data: &[T], target: &T) -> Option<usize> {
    let mut left = 0usize;
    let mut right = data.len();
    while left < right {
        let mid = (left + right) / 2;
        match data[mid].cmp(target) {
            Ordering::Less => left = mid + 1,
            Ordering::Greater => right = mid,
            Ordering::Equal => return Some(mid),
        }
    }
    None
}

/// Insert `element` at its sorted position. With `unique` set an element
/// already present is not inserted again. Returns true if the slice grew.
pub fn sorted_insert<T: Ord>(data: &mut Vec<T>, element: T, unique: bool) -> bool {
    let mut left = 0usize;
    let mut right = data.len();
    while left < right {
        let mid = (left + right) / 2;
        match data[mid].cmp(&element) {
            Ordering::Less => left = mid + 1,
            Ordering::Greater => right = mid,
            Ordering::Equal => {
                if unique {
                    return false;
                }
                data.insert(mid + 1, element);
                return true;
            }
        }
    }
    data.insert(left, element);
    true
}

/// Loading/loaded page sets. A page is in at most one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pages {
    loading: Vec<u32>,
    loaded: Vec<u32>,
}

impl Pages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a page as in flight. Loaded pages are left untouched.
    pub fn add_to_loading(&mut self, page: u32) -> bool {
        if self.is_loaded(page) {
            return false;
        }
        sorted_insert(&mut self.loading, page, true)
    }

    pub fn is_loading(&self, page: u32) -> bool {
        sorted_search(&self.loading, &page).is_some()
    }

    /// Move a page from loading (if present) to loaded.
    pub fn add_to_loaded(&mut self, page: u32) {
        if let Some(idx) = sorted_search(&self.loading, &page) {
            self.loading.remove(idx);
        }
        sorted_insert(&mut self.loaded, page, true);
    }

    pub fn is_loaded(&self, page: u32) -> bool {
        sorted_search(&self.loaded, &page).is_some()
    }

    /// Forget an in-flight page after a failed fetch so it can be requested again.
    pub fn remove_from_loading(&mut self, page: u32) -> bool {
        match sorted_search(&self.loading, &page) {
            Some(idx) => {
                self.loading.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Check-then-mark in one step: returns true if the caller now owns the load.
    pub fn try_begin(&mut self, page: u32) -> bool {
        if self.is_loading(page) || self.is_loaded(page) {
            return false;
        }
        self.add_to_loading(page)
    }

    pub fn loading(&self) -> &[u32] {
        &self.loading
    }

    pub fn loaded(&self) -> &[u32] {
        &self.loaded
    }

    pub fn clear(&mut self) {
        self.loading.clear();
        self.loaded.clear();
    }
}

/// Visible region reported by the grid, in row/column units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl Rect {
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// Inclusive range of zero-based page indices covering a viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub first: u32,
    pub last: u32,
}

impl PageRange {
    pub fn page_count(&self) -> usize {
        (self.last - self.first) as usize + 1
    }

    /// Server page numbers to request. The API counts pages from 1, so page
    /// index `i` is requested as page `i + 1`; page 0 is never requested.
    pub fn requested_pages(&self) -> impl Iterator<Item = u32> {
        (self.first + 1)..=(self.last + 1)
    }
}

/// Map a visible rectangle to the page range that must be resident, with a
/// half-page margin on both ends. Empty rectangles map to nothing.
pub fn visible_pages(rect: &Rect, page_size: u32) -> Option<PageRange> {
    if rect.is_empty() || page_size == 0 {
        return None;
    }
    let size = page_size as f64;
    let half = size / 2.0;
    let top = rect.y as f64;
    let bottom = rect.y.saturating_add(rect.height) as f64;
    // Page numbers are index + 1 and must fit in u32.
    let max_index = f64::from(u32::MAX - 1);
    let first = ((top - half) / size).floor().clamp(0.0, max_index);
    let last = ((bottom + half) / size).floor().clamp(first, max_index);
    Some(PageRange {
        first: first as u32,
        last: last as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_insert_dedupes_and_keeps_order() {
        let mut v = Vec::new();
        for x in [5, 1, 3, 3, 9, 1] {
            sorted_insert(&mut v, x, true);
        }
        assert_eq!(v, vec![1, 3, 5, 9]);
        assert!(sorted_insert(&mut v, 3, false));
        assert_eq!(v, vec![1, 3, 3, 5, 9]);
        assert_eq!(sorted_search(&v, &9), Some(4));
        assert_eq!(sorted_search(&v, &4), None);
        assert_eq!(sorted_search(&Vec::<u32>::new(), &4), None);
    }

    #[test]
    fn loaded_page_leaves_loading() {
        let mut pages = Pages::new();
        assert!(pages.try_begin(3));
        assert!(!pages.try_begin(3));
        assert!(pages.is_loading(3));
        pages.add_to_loaded(3);
        assert!(!pages.is_loading(3));
        assert!(pages.is_loaded(3));
        assert!(!pages.try_begin(3));
        assert!(!pages.add_to_loading(3));
    }

    #[test]
    fn page_sets_stay_disjoint() {
        let mut pages = Pages::new();
        for p in [4u32, 2, 7, 2, 4, 1] {
            pages.add_to_loading(p);
        }
        for p in [2u32, 7, 9] {
            pages.add_to_loaded(p);
        }
        pages.add_to_loading(9);
        for p in 0..12 {
            assert!(!(pages.is_loading(p) && pages.is_loaded(p)), "page {p}");
        }
        assert_eq!(pages.loading(), &[1, 4]);
        assert_eq!(pages.loaded(), &[2, 7, 9]);
    }

    #[test]
    fn failed_page_can_be_retried() {
        let mut pages = Pages::new();
        assert!(pages.try_begin(2));
        assert!(pages.remove_from_loading(2));
        assert!(!pages.is_loading(2) && !pages.is_loaded(2));
        assert!(pages.try_begin(2));
    }

    #[test]
    fn viewport_maps_with_half_page_margin() {
        let range = visible_pages(&Rect::new(0, 95, 10, 20), 10).unwrap();
        assert_eq!(range, PageRange { first: 9, last: 12 });
        assert_eq!(range.requested_pages().collect::<Vec<_>>(), vec![10, 11, 12, 13]);

        let top = visible_pages(&Rect::new(0, 0, 5, 8), 10).unwrap();
        assert_eq!(top.first, 0);
        assert_eq!(top.last, 1);
    }

    #[test]
    fn extreme_viewport_saturates() {
        let range = visible_pages(&Rect::new(0, i64::MAX - 5, 10, i64::MAX), 10).unwrap();
        assert_eq!(range.last, u32::MAX - 1);
        assert_eq!(range.requested_pages().last(), Some(u32::MAX));
        let above = visible_pages(&Rect::new(0, i64::MIN, 10, 20), 10).unwrap();
        assert_eq!(above, PageRange { first: 0, last: 0 });
    }

    #[test]
    fn empty_viewport_maps_to_nothing() {
        assert!(visible_pages(&Rect::new(0, 10, 0, 10), 10).is_none());
        assert!(visible_pages(&Rect::new(0, 10, 10, 0), 10).is_none());
        assert!(visible_pages(&Rect::new(0, 10, 10, 10), 0).is_none());
    }

    #[test]
    fn first_page_is_monotonic_in_y() {
        for page_size in [1u32, 7, 10, 25] {
            let mut prev = 0;
            for y in 0..500 {
                let range = visible_pages(&Rect::new(0, y, 3, 17), page_size).unwrap();
                assert!(range.first >= prev, "y={y} size={page_size}");
                assert!(range.last >= range.first);
                prev = range.first;
            }
        }
    }
}
