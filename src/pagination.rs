/// One review page over an ordered result list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Page<'a, T> {
    /// 1-based page number.
    pub number: usize,
    pub total_pages: usize,
    /// Index of `items[0]` in the full list.
    pub start_index: usize,
    pub items: &'a [T],
}

impl<T> Page<'_, T> {
    pub fn has_previous(&self) -> bool {
        self.number > 1
    }

    pub fn has_next(&self) -> bool {
        self.number < self.total_pages
    }
}

pub fn total_pages(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size.max(1))
}

/// Returns page `number` of `items`. Out of range page numbers are clamped to
/// the first or last page; an empty list has no pages.
pub fn paginate<T>(items: &[T], page_size: usize, number: usize) -> Option<Page<'_, T>> {
    let page_size = page_size.max(1);
    let total_pages = total_pages(items.len(), page_size);
    if total_pages == 0 {
        return None;
    }
    let number = number.clamp(1, total_pages);
    let start_index = (number - 1) * page_size;
    let end = (start_index + page_size).min(items.len());
    Some(Page {
        number,
        total_pages,
        start_index,
        items: &items[start_index..end],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_pages_of_page_size() {
        let items = (0..65).collect::<Vec<_>>();
        assert_eq!(total_pages(items.len(), 30), 3);

        let first = paginate(&items, 30, 1).unwrap();
        assert_eq!(first.items.len(), 30);
        assert!(!first.has_previous());
        assert!(first.has_next());

        let last = paginate(&items, 30, 3).unwrap();
        assert_eq!(last.start_index, 60);
        assert_eq!(last.items, &[60, 61, 62, 63, 64]);
        assert!(last.has_previous());
        assert!(!last.has_next());
    }

    #[test]
    fn page_number_is_clamped() {
        let items = [1, 2, 3];
        assert_eq!(paginate(&items, 2, 0).unwrap().number, 1);
        assert_eq!(paginate(&items, 2, 9).unwrap().number, 2);
    }

    #[test]
    fn empty_list_has_no_pages() {
        assert!(paginate::<u8>(&[], 30, 1).is_none());
        assert_eq!(total_pages(0, 30), 0);
    }
}
