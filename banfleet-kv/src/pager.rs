//! Drives a paged lister to exhaustion.

use crate::error::KvResult;
use crate::list_watch::{ListOption, Lister, PagedList};

const DEFAULT_PAGE_SIZE: i64 = 500;

/// Breaks a large list into chunks of `page_size` and concatenates the
/// pages. Every page after the first is read at the revision of the
/// first, so the result is a consistent snapshot.
pub struct ListPager {
    pub page_size: i64,
}

impl Default for ListPager {
    fn default() -> Self {
        Self { page_size: DEFAULT_PAGE_SIZE }
    }
}

impl ListPager {
    pub fn new(page_size: i64) -> Self {
        Self { page_size }
    }

    pub async fn list<T, L: Lister<T> + ?Sized>(
        &self,
        lister: &L,
        mut options: ListOption,
    ) -> KvResult<PagedList<T>> {
        if options.size == 0 {
            options.size = self.page_size;
        }

        let mut out: Option<PagedList<T>> = None;
        loop {
            let page = lister.list(options.clone()).await?;
            let more = page.more();
            let next_cursor = page.next_cursor.clone();
            let revision = page.revision;

            match out.as_mut() {
                None => out = Some(page),
                Some(acc) => {
                    acc.items.extend(page.items);
                    acc.total_count = page.total_count;
                    acc.total_page = page.total_page;
                    acc.current_page = page.current_page;
                    acc.revision = page.revision;
                    acc.next_cursor = page.next_cursor;
                }
            }

            if !more {
                let mut done = out.take().unwrap_or_else(|| PagedList::empty(revision));
                done.next_cursor = String::new();
                return Ok(done);
            }

            options.cursor = next_cursor;
            options.revision = revision;
        }
    }
}
