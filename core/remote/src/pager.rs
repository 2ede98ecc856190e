//! Paging contracts for remote enumerations.

use async_trait::async_trait;

use keepsake_common::Result;

/// One page of a plain listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub values: Vec<T>,
    /// Link to the next page. `None` on the last page.
    pub next_link: Option<String>,
}

/// One page of a delta enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaPage<T> {
    pub values: Vec<T>,
    /// Link to the next page of this enumeration.
    pub next_link: Option<String>,
    /// Token to resume from on the next enumeration. Set on the last page.
    pub delta_link: Option<String>,
}

impl<T> DeltaPage<T> {
    pub fn has_more(&self) -> bool {
        self.next_link.is_some()
    }
}

/// A paged listing.
#[async_trait]
pub trait Pager<T: Send>: Send + Sync {
    /// Fetch a page. `link` is `None` for the first page, then the previous
    /// page's `next_link`.
    async fn next_page(&self, link: Option<&str>) -> Result<Page<T>>;
}

/// A paged delta enumeration that can resume from a previous delta token.
#[async_trait]
pub trait DeltaPager<T: Send>: Send + Sync {
    /// Fetch a page.
    ///
    /// `link` is the stored delta token (or `None` for a full enumeration) on
    /// the first call, then the previous page's `next_link`.
    ///
    /// # Errors
    /// - Any page-level failure; callers abort the whole enumeration
    async fn next_page(&self, link: Option<&str>) -> Result<DeltaPage<T>>;
}

/// Walk every page of `pager`.
pub async fn collect_all<T: Send>(pager: &dyn Pager<T>) -> Result<Vec<T>> {
    let mut values = Vec::new();
    let mut link: Option<String> = None;

    loop {
        let page = pager.next_page(link.as_deref()).await?;
        values.extend(page.values);

        match page.next_link {
            Some(next) => link = Some(next),
            None => return Ok(values),
        }
    }
}

/// Walk every page of a delta enumeration starting at `start`, handing each
/// page's values to `on_page`. Returns the final delta token.
pub async fn walk_delta<T, F>(
    pager: &dyn DeltaPager<T>,
    start: Option<&str>,
    mut on_page: F,
) -> Result<Option<String>>
where
    T: Send,
    F: FnMut(Vec<T>) -> Result<()> + Send,
{
    let mut link = start.map(String::from);

    loop {
        let page = pager.next_page(link.as_deref()).await?;
        let more = page.has_more();
        on_page(page.values)?;

        if !more {
            return Ok(page.delta_link);
        }
        link = page.next_link;
    }
}
