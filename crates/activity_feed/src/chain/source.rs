//! The fetcher boundary: one page of normalized history per call.

use crate::chain::http::FetchError;
use crate::model::{Activity, AssetSlug};
use crate::pointer::Pointer;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// One page of history, newest first. `next_pointer == None` with `reached_end` means
/// the source has no older records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActivityPage {
    pub activities: Vec<Activity>,
    pub next_pointer: Option<Pointer>,
    pub reached_end: bool,
}

impl ActivityPage {
    pub fn end() -> Self {
        Self {
            activities: Vec::new(),
            next_pointer: None,
            reached_end: true,
        }
    }
}

/// An upstream history source for one chain.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Genesis pointer of this source's pointer family.
    fn genesis(&self) -> crate::pointer::Pointer;

    /// Fetch the page strictly older than `older_than` (newest page when `None`).
    /// Implementations check `cancel` between upstream requests.
    async fn fetch_page(
        &self,
        account: &str,
        asset: Option<&AssetSlug>,
        older_than: Option<&Pointer>,
        cancel: &CancellationToken,
    ) -> Result<ActivityPage, FetchError>;
}
