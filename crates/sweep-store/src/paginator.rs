//! Lazy, restartable paging over a query or scan.

use futures_util::Stream;
use futures_util::stream;
use tracing::{debug, trace};

use crate::StoreError;
use crate::condition::ReadRequest;
use crate::record::{Cursor, Record};
use crate::retry::{RetryConfig, with_retry};
use crate::store::{Page, Store};

/// Walks a [`ReadRequest`] page by page, carrying the store's cursor.
///
/// Pages may be empty while the cursor is still live (filters apply after the
/// page limit), so callers loop until [`Paginator::is_exhausted`], never until
/// a page happens to be non-empty. A failed read leaves the cursor where it
/// was, so calling [`Paginator::next_page`] again repeats the same read.
pub struct Paginator<S> {
    store: S,
    request: ReadRequest,
    cursor: Option<Cursor>,
    exhausted: bool,
    retry: RetryConfig,
    pages_read: u64,
}

impl<S: Store> Paginator<S> {
    pub fn new(store: S, request: ReadRequest) -> Self {
        Self {
            store,
            request,
            cursor: None,
            exhausted: false,
            retry: RetryConfig::default(),
            pages_read: 0,
        }
    }

    /// Start after `cursor` instead of from the beginning.
    pub fn resume_from(mut self, cursor: Option<Cursor>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn request(&self) -> &ReadRequest {
        &self.request
    }

    /// Cursor for the next read; `None` before the first page or once exhausted.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn pages_read(&self) -> u64 {
        self.pages_read
    }

    /// Fetch the next page, or `None` once the store has reported the end.
    ///
    /// Retryable store errors are retried with backoff against the same cursor.
    pub async fn next_page(&mut self) -> Result<Option<Page>, StoreError> {
        if self.exhausted {
            return Ok(None);
        }

        let page = {
            let store = &self.store;
            let request = &self.request;
            let start = self.cursor.as_ref();
            with_retry(&self.retry, "read_page", move || store.read_page(request, start)).await?
        };

        self.pages_read += 1;
        trace!(
            table = %self.request.table,
            index = ?self.request.index,
            items = page.items.len(),
            has_more = page.cursor.is_some(),
            "read page"
        );

        match &page.cursor {
            Some(next) => self.cursor = Some(next.clone()),
            None => {
                self.cursor = None;
                self.exhausted = true;
                debug!(
                    table = %self.request.table,
                    pages = self.pages_read,
                    "pagination exhausted"
                );
            }
        }

        Ok(Some(page))
    }

    /// Drain every remaining page into one list.
    pub async fn collect_all(mut self) -> Result<Vec<Record>, StoreError> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page.items);
        }
        Ok(items)
    }

    /// Turn the paginator into a stream of pages. The stream ends after the
    /// terminal page or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Page, StoreError>> {
        stream::try_unfold(self, |mut paginator| async move {
            Ok(paginator.next_page().await?.map(|page| (page, paginator)))
        })
    }
}
