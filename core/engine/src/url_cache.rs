//! Download URL cache for one drive.
//!
//! Download URLs handed out by the remote expire. Rather than asking the
//! remote for a fresh URL per item, the cache re-walks the drive's delta
//! enumeration once per refresh interval and answers every lookup from the
//! resulting snapshot.
//!
//! Refreshes are single-flight: callers that find the cache stale queue on
//! one async mutex, the first performs the enumeration, and the rest share
//! its outcome (success or error) instead of enumerating again.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use keepsake_common::{Error, Result};
use keepsake_remote::{walk_delta, DeltaPager, DriveItem};

/// Refresh intervals below this are rejected as misconfiguration.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// What the cache knows about one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemProps {
    /// Empty when the item is deleted.
    pub download_url: String,
    pub is_deleted: bool,
}

#[derive(Debug, Default)]
struct Snapshot {
    id_to_props: HashMap<String, ItemProps>,
    last_refresh: Option<Instant>,
    delta_query_count: usize,
}

#[derive(Debug, Default)]
struct Flight {
    attempts: u64,
    last_error: Option<String>,
}

/// Per-drive cache of download URLs.
pub struct UrlCache {
    drive_id: String,
    prev_delta: Option<String>,
    refresh_interval: Duration,
    pager: Arc<dyn DeltaPager<DriveItem>>,
    snapshot: RwLock<Snapshot>,
    flight: Mutex<Flight>,
    /// Mirror of `Flight::attempts`, readable without waiting on a refresh.
    attempts: AtomicU64,
}

impl UrlCache {
    /// Create a cache for `drive_id`.
    ///
    /// `prev_delta` is the delta token the enumeration resumes from; `None`
    /// enumerates the whole drive.
    ///
    /// # Errors
    /// - Empty drive id
    /// - Refresh interval below `MIN_REFRESH_INTERVAL`
    pub fn new(
        drive_id: impl Into<String>,
        prev_delta: Option<String>,
        refresh_interval: Duration,
        pager: Arc<dyn DeltaPager<DriveItem>>,
    ) -> Result<Self> {
        let drive_id = drive_id.into();
        if drive_id.is_empty() {
            return Err(Error::InvalidInput("url cache drive id is empty".to_string()));
        }
        if refresh_interval < MIN_REFRESH_INTERVAL {
            return Err(Error::InvalidInput(format!(
                "url cache refresh interval {:?} is below the minimum of {:?}",
                refresh_interval, MIN_REFRESH_INTERVAL
            )));
        }

        Ok(Self {
            drive_id,
            prev_delta,
            refresh_interval,
            pager,
            snapshot: RwLock::new(Snapshot::default()),
            flight: Mutex::new(Flight::default()),
            attempts: AtomicU64::new(0),
        })
    }

    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }

    /// Look up the download URL and deleted flag of an item, refreshing first
    /// when the cache is empty or stale.
    ///
    /// # Errors
    /// - Empty item id
    /// - `Error::CacheRefresh` if the refresh this call waited on failed
    /// - `Error::NotFound` if the item is absent after a good refresh
    pub async fn get_item_properties(&self, item_id: &str) -> Result<ItemProps> {
        if item_id.is_empty() {
            return Err(Error::InvalidInput("item id is empty".to_string()));
        }

        if self.needs_refresh() {
            self.refresh().await?;
        }

        self.read_cache(item_id)
    }

    /// True when the cache is empty or the refresh interval has elapsed.
    pub fn needs_refresh(&self) -> bool {
        let snapshot = self.snapshot.read();
        if snapshot.id_to_props.is_empty() {
            return true;
        }
        match snapshot.last_refresh {
            Some(at) => at.elapsed() > self.refresh_interval,
            None => true,
        }
    }

    /// Successful enumerations so far.
    pub fn delta_query_count(&self) -> usize {
        self.snapshot.read().delta_query_count
    }

    /// Number of cached items.
    pub fn len(&self) -> usize {
        self.snapshot.read().id_to_props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_refresh(&self) -> Option<Instant> {
        self.snapshot.read().last_refresh
    }

    #[instrument(skip(self), fields(drive_id = %self.drive_id))]
    async fn refresh(&self) -> Result<()> {
        let observed = self.attempts.load(Ordering::Acquire);
        let mut flight = self.flight.lock().await;

        if flight.attempts != observed {
            // Another caller finished a refresh while this one waited.
            return match &flight.last_error {
                Some(reason) => Err(self.refresh_error(reason.clone())),
                None => Ok(()),
            };
        }
        if !self.needs_refresh() {
            return Ok(());
        }

        debug!("Refreshing url cache");
        let outcome = self.enumerate().await;
        flight.attempts += 1;
        self.attempts.store(flight.attempts, Ordering::Release);

        match outcome {
            Ok(fresh) => {
                let mut snapshot = self.snapshot.write();
                snapshot.id_to_props = fresh;
                snapshot.last_refresh = Some(Instant::now());
                snapshot.delta_query_count += 1;
                flight.last_error = None;
                info!("Url cache refreshed with {} items", snapshot.id_to_props.len());
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                error!("Url cache refresh failed: {}", reason);
                flight.last_error = Some(reason.clone());
                Err(self.refresh_error(reason))
            }
        }
    }

    /// Walk every delta page into a fresh map. Nothing is committed here, so
    /// a failed walk leaves the previous snapshot untouched.
    async fn enumerate(&self) -> Result<HashMap<String, ItemProps>> {
        let mut fresh = HashMap::new();

        walk_delta(
            self.pager.as_ref(),
            self.prev_delta.as_deref(),
            |items| {
                for item in items {
                    let (id, props) = Self::props_for(item)?;
                    // Later records for the same id supersede earlier ones.
                    fresh.insert(id, props);
                }
                Ok(())
            },
        )
        .await?;

        Ok(fresh)
    }

    fn props_for(item: DriveItem) -> Result<(String, ItemProps)> {
        if item.is_folder {
            return Err(Error::UnexpectedFolder(item.id));
        }
        if item.deleted {
            return Ok((
                item.id,
                ItemProps {
                    download_url: String::new(),
                    is_deleted: true,
                },
            ));
        }

        match item.download_url {
            Some(url) if !url.is_empty() => Ok((
                item.id,
                ItemProps {
                    download_url: url,
                    is_deleted: false,
                },
            )),
            _ => Err(Error::Remote(format!(
                "file {} has no download url",
                item.id
            ))),
        }
    }

    fn read_cache(&self, item_id: &str) -> Result<ItemProps> {
        self.snapshot
            .read()
            .id_to_props
            .get(item_id)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "item {} not found in url cache for drive {}",
                    item_id, self.drive_id
                ))
            })
    }

    fn refresh_error(&self, reason: String) -> Error {
        Error::CacheRefresh {
            container: self.drive_id.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use keepsake_remote::DeltaPage;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    enum Step {
        Page(DeltaPage<DriveItem>),
        Fail(String),
    }

    /// Replays its steps in order, wrapping around.
    struct ScriptedPager {
        steps: SyncMutex<Vec<Step>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedPager {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Self::slow(steps, Duration::ZERO)
        }

        fn slow(steps: Vec<Step>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                steps: SyncMutex::new(steps),
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn replace(&self, steps: Vec<Step>) {
            *self.steps.lock() = steps;
            self.calls.store(0, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeltaPager<DriveItem> for ScriptedPager {
        async fn next_page(&self, _link: Option<&str>) -> Result<DeltaPage<DriveItem>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let step = {
                let steps = self.steps.lock();
                steps[n % steps.len()].clone()
            };
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match step {
                Step::Page(page) => Ok(page),
                Step::Fail(reason) => Err(Error::Network(reason)),
            }
        }
    }

    fn file(id: &str, url: &str) -> DriveItem {
        DriveItem {
            id: id.to_string(),
            name: format!("{}.txt", id),
            parent_id: Some("root".to_string()),
            is_folder: false,
            deleted: false,
            download_url: Some(url.to_string()),
            size: 1,
            modified: Utc::now(),
        }
    }

    fn deleted(id: &str) -> DriveItem {
        DriveItem {
            deleted: true,
            download_url: None,
            ..file(id, "")
        }
    }

    fn folder(id: &str) -> DriveItem {
        DriveItem {
            is_folder: true,
            download_url: None,
            ..file(id, "")
        }
    }

    fn last_page(items: Vec<DriveItem>) -> Step {
        Step::Page(DeltaPage {
            values: items,
            next_link: None,
            delta_link: Some("delta".to_string()),
        })
    }

    fn middle_page(items: Vec<DriveItem>) -> Step {
        Step::Page(DeltaPage {
            values: items,
            next_link: Some("next".to_string()),
            delta_link: None,
        })
    }

    fn cache_over(pager: Arc<ScriptedPager>) -> Arc<UrlCache> {
        Arc::new(UrlCache::new("drive-1", None, Duration::from_secs(3600), pager).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_refresh() {
        let items: Vec<DriveItem> = (1..=5)
            .map(|i| file(&i.to_string(), &format!("https://dl/{}", i)))
            .collect();
        let pager = ScriptedPager::slow(vec![last_page(items)], Duration::from_millis(50));
        let cache = cache_over(pager.clone());

        let mut handles = Vec::new();
        for i in 0..100 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let pause = rand::random::<u64>() % 100;
                tokio::time::sleep(Duration::from_millis(pause)).await;
                let id = (i % 5 + 1).to_string();
                let props = cache.get_item_properties(&id).await.unwrap();
                (id, props)
            }));
        }
        for handle in handles {
            let (id, props) = handle.await.unwrap();
            assert_eq!(props.download_url, format!("https://dl/{}", id));
            assert!(!props.is_deleted);
        }

        assert_eq!(cache.delta_query_count(), 1);
        assert_eq!(pager.calls(), 1);
        assert_eq!(cache.len(), 5);
    }

    #[tokio::test]
    async fn test_duplicate_records_last_write_wins() {
        let pager = ScriptedPager::new(vec![
            middle_page(vec![file("1", "u1"), file("2", "u2"), file("3", "u3")]),
            last_page(vec![file("1", "u1-new"), file("2", "u2-new")]),
        ]);
        let cache = cache_over(pager);

        let props = cache.get_item_properties("1").await.unwrap();
        assert_eq!(props.download_url, "u1-new");
        assert_eq!(cache.get_item_properties("2").await.unwrap().download_url, "u2-new");
        assert_eq!(cache.get_item_properties("3").await.unwrap().download_url, "u3");
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.delta_query_count(), 1);
    }

    #[tokio::test]
    async fn test_deleted_records() {
        let pager = ScriptedPager::new(vec![last_page(vec![
            file("1", "u1"),
            file("2", "u2"),
            deleted("1"),
        ])]);
        let cache = cache_over(pager);

        let props = cache.get_item_properties("1").await.unwrap();
        assert_eq!(
            props,
            ItemProps {
                download_url: String::new(),
                is_deleted: true
            }
        );
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_item_not_found_after_refresh() {
        let pager = ScriptedPager::new(vec![last_page(vec![file("1", "u1")])]);
        let cache = cache_over(pager);

        let err = cache.get_item_properties("2").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.delta_query_count(), 1);
    }

    #[tokio::test]
    async fn test_page_error_leaves_cache_empty() {
        let pager = ScriptedPager::new(vec![
            middle_page(vec![file("1", "u1")]),
            Step::Fail("connection reset".to_string()),
        ]);
        let cache = cache_over(pager);

        let err = cache.get_item_properties("1").await.unwrap_err();
        assert!(matches!(err, Error::CacheRefresh { .. }));
        assert!(cache.is_empty());
        assert_eq!(cache.delta_query_count(), 0);
        assert!(cache.last_refresh().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_refresh_error_reaches_every_waiter() {
        let pager = ScriptedPager::slow(
            vec![
                middle_page(vec![file("1", "u1")]),
                Step::Fail("connection reset".to_string()),
            ],
            Duration::from_millis(50),
        );
        let cache = cache_over(pager.clone());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_item_properties("1").await })
            })
            .collect();
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::CacheRefresh { .. }));
        }

        assert!(pager.calls() >= 2);
        assert!(cache.is_empty());
        assert_eq!(cache.delta_query_count(), 0);
    }

    #[tokio::test]
    async fn test_folder_record_is_an_error() {
        let pager = ScriptedPager::new(vec![last_page(vec![file("1", "u1"), folder("2")])]);
        let cache = cache_over(pager);

        let err = cache.get_item_properties("1").await.unwrap_err();
        match err {
            Error::CacheRefresh { container, reason } => {
                assert_eq!(container, "drive-1");
                assert!(reason.contains("Unexpected folder"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(cache.is_empty());
        assert_eq!(cache.delta_query_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_good_snapshot() {
        let pager = ScriptedPager::new(vec![last_page(vec![file("1", "u1"), file("2", "u2")])]);
        let cache = cache_over(pager.clone());
        cache.get_item_properties("1").await.unwrap();

        pager.replace(vec![Step::Fail("expired token".to_string())]);
        cache.snapshot.write().last_refresh =
            Instant::now().checked_sub(Duration::from_secs(7200));

        let err = cache.get_item_properties("1").await.unwrap_err();
        assert!(matches!(err, Error::CacheRefresh { .. }));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.delta_query_count(), 1);
    }

    #[tokio::test]
    async fn test_needs_refresh() {
        let pager = ScriptedPager::new(vec![last_page(vec![file("1", "u1")])]);
        let cache = Arc::new(
            UrlCache::new("drive-1", None, Duration::from_secs(1), pager).unwrap(),
        );

        assert!(cache.needs_refresh());

        cache.get_item_properties("1").await.unwrap();
        assert!(!cache.needs_refresh());

        cache.snapshot.write().last_refresh =
            Instant::now().checked_sub(Duration::from_millis(1500));
        assert!(cache.needs_refresh());

        cache.snapshot.write().last_refresh = Some(Instant::now());
        assert!(!cache.needs_refresh());
    }

    #[tokio::test]
    async fn test_construction_validation() {
        let pager = ScriptedPager::new(vec![last_page(Vec::new())]);

        assert!(UrlCache::new("", None, Duration::from_secs(60), pager.clone()).is_err());
        assert!(
            UrlCache::new("drive-1", None, Duration::from_millis(100), pager.clone()).is_err()
        );
        assert!(UrlCache::new("drive-1", None, Duration::from_secs(1), pager.clone()).is_ok());
        assert!(UrlCache::new(
            "drive-1",
            Some("delta:4".to_string()),
            Duration::from_secs(60),
            pager
        )
        .is_ok());
    }

    #[tokio::test]
    async fn test_empty_item_id_rejected() {
        let pager = ScriptedPager::new(vec![last_page(vec![file("1", "u1")])]);
        let cache = cache_over(pager.clone());

        assert!(cache.get_item_properties("").await.is_err());
        assert_eq!(pager.calls(), 0);
    }
}
