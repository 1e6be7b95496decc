//! Lazy pull-based queue over paginated backends
//!
//! [`PagedResultQueue`] hides cursors and page boundaries behind two calls:
//! [`peek`](PagedResultQueue::peek) and [`shift`](PagedResultQueue::shift).
//! It buffers at most one page, fetches pages strictly one after another,
//! and returns `None` once the backend is exhausted. `None` is terminal:
//! the queue never restarts.
//!
//! ```rust,ignore
//! use dip_coordinator::{backend::S3ListingFetcher, paged::PagedResultQueue};
//!
//! let fetcher = S3ListingFetcher::new(client, "dip-internal", "staging/", 1000);
//! let mut queue = PagedResultQueue::new(fetcher);
//! while let Some(object) = queue.shift().await? {
//!     tracing::info!(key = %object.key, "found object");
//! }
//! ```

use futures::Stream;
use std::collections::VecDeque;
use tracing::{debug, trace};

use crate::backend::PageFetcher;
use crate::error::{CoordinatorError, Result};

pub struct PagedResultQueue<F: PageFetcher> {
    fetcher: F,
    buffer: VecDeque<F::Item>,
    cursor: Option<F::Cursor>,
    exhausted: bool,
    pages_fetched: usize,
}

impl<F: PageFetcher> PagedResultQueue<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
            pages_fetched: 0,
        }
    }

    /// Next item without consuming it; repeated calls return the same item
    pub async fn peek(&mut self) -> Result<Option<&F::Item>> {
        self.fill().await?;
        Ok(self.buffer.front())
    }

    /// Remove and return the next item
    pub async fn shift(&mut self) -> Result<Option<F::Item>> {
        self.fill().await?;
        Ok(self.buffer.pop_front())
    }

    /// Whether the end of the backend data has been reached and drained
    pub fn is_finished(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    /// Items currently held in memory
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Consume the queue as a stream that ends where `shift` returns `None`
    pub fn into_stream(self) -> impl Stream<Item = Result<F::Item>> {
        futures::stream::try_unfold(self, |mut queue| async move {
            let next = queue.shift().await?;
            Ok::<_, CoordinatorError>(next.map(|item| (item, queue)))
        })
    }

    /// Fetch pages until something is buffered or the backend runs dry.
    ///
    /// Empty pages with `has_more` set are skipped without returning to the
    /// caller. A failed fetch leaves the cursor untouched, so calling again
    /// retries the same page. A page claiming more results without a cursor
    /// is discarded and ends the scan.
    async fn fill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let page = self.fetcher.fetch_page(self.cursor.as_ref()).await?;
            self.pages_fetched += 1;

            trace!(
                page = self.pages_fetched,
                records = page.records.len(),
                has_more = page.has_more,
                "Fetched page"
            );

            if page.has_more {
                let Some(cursor) = page.cursor else {
                    // Latch the end so this page is never refetched or re-emitted
                    self.cursor = None;
                    self.exhausted = true;
                    return Err(CoordinatorError::Pagination(format!(
                        "page {} reported more results without a cursor",
                        self.pages_fetched
                    )));
                };
                self.buffer.extend(page.records);
                self.cursor = Some(cursor);
            } else {
                self.buffer.extend(page.records);
                self.cursor = None;
                self.exhausted = true;
                debug!(pages = self.pages_fetched, "Paged scan exhausted");
            }
        }

        Ok(())
    }
}
