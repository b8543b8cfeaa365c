//! # Automatic Pagination
//!
//! The paging decorator hides multi-call pagination behind a unified element
//! stream while still exposing page-level and fixed-size-collection views.
//!
//! A [`PageDescriptor`] is a stateless strategy describing how a request
//! carries a continuation token and how a response yields its elements and
//! the next token. [`UnaryCallable::page_streaming`] combines a callable
//! with a descriptor into a [`PagedCallable`], whose `call` returns a
//! [`PagedListResponse`]:
//!
//! - [`PagedListResponse::all_elements`] — a lazy stream of elements
//!   spanning all pages, fetching the next page only once the current one
//!   is exhausted.
//! - [`PagedListResponse::page`] — the first [`Page`]; further pages are
//!   fetched on demand through [`Page::next_page`].
//! - [`PagedListResponse::expand_to_fixed_size_collection`] — regroups the
//!   page-delimited stream into exactly-N chunks.
//!
//! The empty token is both the value injected into the first request and
//! the sentinel meaning "no more pages"; an empty page is terminal
//! regardless of its token. Pages hold the callable and the last token,
//! never each other, so no chain of realized pages accumulates.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};

use crate::callable::UnaryCallable;
use crate::context::CallContext;
use crate::error::{Error, Result};

/// Stateless strategy describing how a request/response pair paginates.
///
/// `inject_page_size` and `extract_page_size` default to "the request does
/// not carry a page size"; override them when it does.
pub trait PageDescriptor: Send + Sync + 'static {
    type Request: Clone + Send + Sync + 'static;
    type Response: Send + Sync + 'static;
    type Element: Clone + Send + Sync + 'static;
    type Token: Clone + PartialEq + Send + Sync + 'static;

    /// The token injected into the first request; also the end-of-list
    /// sentinel returned by [`extract_next_token`](Self::extract_next_token).
    fn empty_token(&self) -> Self::Token;

    /// Rebuild a request so it resumes from `token`.
    fn inject_token(&self, request: &Self::Request, token: Self::Token) -> Self::Request;

    /// Rebuild a request with a page-size hint.
    fn inject_page_size(&self, request: &Self::Request, page_size: usize) -> Self::Request {
        let _ = page_size;
        request.clone()
    }

    /// The page size a request asks for, when it carries one.
    fn extract_page_size(&self, request: &Self::Request) -> Option<usize> {
        let _ = request;
        None
    }

    /// The continuation token of a response; equals
    /// [`empty_token`](Self::empty_token) iff no further pages exist.
    fn extract_next_token(&self, response: &Self::Response) -> Self::Token;

    /// The ordered elements of a response.
    fn extract_resources(&self, response: &Self::Response) -> Vec<Self::Element>;
}

/// A callable whose `call` returns a [`PagedListResponse`].
pub struct PagedCallable<D: PageDescriptor> {
    callable: UnaryCallable<D::Request, D::Response>,
    descriptor: Arc<D>,
    page_size: Option<usize>,
}

impl<D: PageDescriptor> Clone for PagedCallable<D> {
    fn clone(&self) -> Self {
        Self {
            callable: self.callable.clone(),
            descriptor: self.descriptor.clone(),
            page_size: self.page_size,
        }
    }
}

impl<D: PageDescriptor> PagedCallable<D> {
    pub(crate) fn new(callable: UnaryCallable<D::Request, D::Response>, descriptor: Arc<D>) -> Self {
        Self {
            callable,
            descriptor,
            page_size: None,
        }
    }

    /// Inject a page-size hint into every outgoing first request.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Asynchronous call: the response resolves once the first page is
    /// fetched.
    pub fn future_call(&self, request: D::Request) -> BoxFuture<'static, Result<PagedListResponse<D>>> {
        self.future_call_with(request, CallContext::new())
    }

    /// Asynchronous call with an explicit context.
    pub fn future_call_with(
        &self,
        request: D::Request,
        context: CallContext,
    ) -> BoxFuture<'static, Result<PagedListResponse<D>>> {
        let callable = self.callable.clone();
        let descriptor = self.descriptor.clone();
        let page_size = self.page_size;
        Box::pin(async move {
            let mut request = descriptor.inject_token(&request, descriptor.empty_token());
            if let Some(size) = page_size {
                request = descriptor.inject_page_size(&request, size);
            }
            let page = fetch_page(callable, descriptor, context, request).await?;
            Ok(PagedListResponse { page })
        })
    }

    /// Fetch the first page and return the paged response.
    pub async fn call(&self, request: D::Request) -> Result<PagedListResponse<D>> {
        self.future_call(request).await
    }

    /// As [`call`](Self::call), with an explicit context.
    pub async fn call_with(
        &self,
        request: D::Request,
        context: CallContext,
    ) -> Result<PagedListResponse<D>> {
        self.future_call_with(request, context).await
    }
}

async fn fetch_page<D: PageDescriptor>(
    callable: UnaryCallable<D::Request, D::Response>,
    descriptor: Arc<D>,
    context: CallContext,
    request: D::Request,
) -> Result<Page<D>> {
    let response = callable
        .future_call_with(request.clone(), context.clone())
        .await?;
    let elements = descriptor.extract_resources(&response);
    let next_token = descriptor.extract_next_token(&response);
    Ok(Page {
        callable,
        descriptor,
        context,
        request,
        response,
        elements,
        next_token,
    })
}

/// Snapshot of one fetched page.
pub struct Page<D: PageDescriptor> {
    callable: UnaryCallable<D::Request, D::Response>,
    descriptor: Arc<D>,
    context: CallContext,
    request: D::Request,
    response: D::Response,
    elements: Vec<D::Element>,
    next_token: D::Token,
}

impl<D: PageDescriptor> Page<D> {
    /// The elements of this page, in the response's declared order.
    pub fn elements(&self) -> &[D::Element] {
        &self.elements
    }

    pub fn iter(&self) -> std::slice::Iter<'_, D::Element> {
        self.elements.iter()
    }

    /// The request that produced this page.
    pub fn request(&self) -> &D::Request {
        &self.request
    }

    /// The raw response this page was extracted from.
    pub fn response(&self) -> &D::Response {
        &self.response
    }

    pub fn next_token(&self) -> &D::Token {
        &self.next_token
    }

    /// Whether another page exists: the token differs from the empty token
    /// and this page was not itself empty.
    pub fn has_next_page(&self) -> bool {
        self.next_token != self.descriptor.empty_token() && !self.elements.is_empty()
    }

    /// Fetch the next page on demand, rebuilding the request by injecting
    /// this page's token.
    pub async fn next_page(&self) -> Result<Option<Page<D>>> {
        if !self.has_next_page() {
            return Ok(None);
        }
        let request = self
            .descriptor
            .inject_token(&self.request, self.next_token.clone());
        fetch_page(
            self.callable.clone(),
            self.descriptor.clone(),
            self.context.clone(),
            request,
        )
        .await
        .map(Some)
    }

    fn cursor(&self) -> PageCursor<D> {
        PageCursor {
            callable: self.callable.clone(),
            descriptor: self.descriptor.clone(),
            context: self.context.clone(),
            request: self.request.clone(),
            next_token: self.next_token.clone(),
            has_next: self.has_next_page(),
        }
    }
}

impl<'a, D: PageDescriptor> IntoIterator for &'a Page<D> {
    type Item = &'a D::Element;
    type IntoIter = std::slice::Iter<'a, D::Element>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter()
    }
}

/// Continuation state carried between page fetches: the last request, its
/// response's token, and whether a next page exists at all.
struct PageCursor<D: PageDescriptor> {
    callable: UnaryCallable<D::Request, D::Response>,
    descriptor: Arc<D>,
    context: CallContext,
    request: D::Request,
    next_token: D::Token,
    has_next: bool,
}

impl<D: PageDescriptor> Clone for PageCursor<D> {
    fn clone(&self) -> Self {
        Self {
            callable: self.callable.clone(),
            descriptor: self.descriptor.clone(),
            context: self.context.clone(),
            request: self.request.clone(),
            next_token: self.next_token.clone(),
            has_next: self.has_next,
        }
    }
}

impl<D: PageDescriptor> PageCursor<D> {
    async fn fetch_next(self) -> Result<(Vec<D::Element>, PageCursor<D>)> {
        let request = self
            .descriptor
            .inject_token(&self.request, self.next_token.clone());
        let response = self
            .callable
            .future_call_with(request.clone(), self.context.clone())
            .await?;
        let elements = self.descriptor.extract_resources(&response);
        let next_token = self.descriptor.extract_next_token(&response);
        let has_next = next_token != self.descriptor.empty_token() && !elements.is_empty();
        Ok((
            elements,
            PageCursor {
                callable: self.callable,
                descriptor: self.descriptor,
                context: self.context,
                request,
                next_token,
                has_next,
            },
        ))
    }
}

/// Root handle returned by a paging call.
pub struct PagedListResponse<D: PageDescriptor> {
    page: Page<D>,
}

impl<D: PageDescriptor> PagedListResponse<D> {
    /// The first page.
    pub fn page(&self) -> &Page<D> {
        &self.page
    }

    /// A lazy, ordered stream of every element across all pages.
    ///
    /// The next page is fetched only when the current page's elements are
    /// exhausted and its token is not the empty token.
    pub fn all_elements(&self) -> BoxStream<'static, Result<D::Element>> {
        let buffered: VecDeque<D::Element> = self.page.elements().to_vec().into();
        let cursor = Some(self.page.cursor());
        Box::pin(stream::try_unfold(
            (buffered, cursor),
            |(mut buffered, mut cursor)| async move {
                loop {
                    if let Some(element) = buffered.pop_front() {
                        return Ok(Some((element, (buffered, cursor))));
                    }
                    match cursor.take() {
                        Some(c) if c.has_next => {
                            let (elements, next) = c.fetch_next().await?;
                            buffered = elements.into();
                            cursor = Some(next);
                        }
                        _ => return Ok(None),
                    }
                }
            },
        ))
    }

    /// Regroup the element stream into exactly-`collection_size` chunks.
    ///
    /// Fails with [`Error::Validation`] when `collection_size` is smaller
    /// than the first page's declared page size, or when a page boundary
    /// would overrun the collection mid-page; pages are never re-chunked
    /// and no page beyond the needed ones is fetched.
    pub async fn expand_to_fixed_size_collection(
        &self,
        collection_size: usize,
    ) -> Result<FixedSizeCollection<D>> {
        FixedSizeCollection::expand(
            self.page.elements().to_vec(),
            self.page.cursor(),
            collection_size,
        )
        .await
    }
}

/// A fixed-size re-chunking of a page-delimited element stream.
///
/// Every collection except the terminal one holds exactly
/// `collection_size` elements.
pub struct FixedSizeCollection<D: PageDescriptor> {
    elements: Vec<D::Element>,
    collection_size: usize,
    cursor: PageCursor<D>,
}

impl<D: PageDescriptor> std::fmt::Debug for FixedSizeCollection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedSizeCollection")
            .field("elements_len", &self.elements.len())
            .field("collection_size", &self.collection_size)
            .finish()
    }
}

impl<D: PageDescriptor> FixedSizeCollection<D> {
    async fn expand(
        mut elements: Vec<D::Element>,
        mut cursor: PageCursor<D>,
        collection_size: usize,
    ) -> Result<Self> {
        if collection_size == 0 {
            return Err(Error::validation("collection size must be positive"));
        }
        if let Some(page_size) = cursor.descriptor.extract_page_size(&cursor.request) {
            if collection_size < page_size {
                return Err(Error::validation(format!(
                    "collection size too small: {collection_size} is less than the page size {page_size}"
                )));
            }
        }
        while elements.len() < collection_size && cursor.has_next {
            let (next, next_cursor) = cursor.fetch_next().await?;
            if elements.len() + next.len() > collection_size {
                return Err(Error::validation(format!(
                    "too many elements: page boundary does not align with collection size {collection_size}"
                )));
            }
            elements.extend(next);
            cursor = next_cursor;
        }
        Ok(Self {
            elements,
            collection_size,
            cursor,
        })
    }

    pub fn elements(&self) -> &[D::Element] {
        &self.elements
    }

    pub fn iter(&self) -> std::slice::Iter<'_, D::Element> {
        self.elements.iter()
    }

    pub fn collection_size(&self) -> usize {
        self.collection_size
    }

    pub fn has_next_collection(&self) -> bool {
        self.cursor.has_next
    }

    /// Fetch and regroup the next collection; `None` once the stream ends.
    pub async fn next_collection(&self) -> Result<Option<FixedSizeCollection<D>>> {
        if !self.cursor.has_next {
            return Ok(None);
        }
        let (elements, cursor) = self.cursor.clone().fetch_next().await?;
        Self::expand(elements, cursor, self.collection_size)
            .await
            .map(Some)
    }
}

impl<'a, D: PageDescriptor> IntoIterator for &'a FixedSizeCollection<D> {
    type Item = &'a D::Element;
    type IntoIter = std::slice::Iter<'a, D::Element>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter()
    }
}
