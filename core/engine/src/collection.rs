//! Item collection stream.
//!
//! A collection turns one container's added and removed item ids into a
//! stream of item records:
//! - removed ids become tombstones immediately
//! - added ids are fetched and serialized with bounded parallelism
//! - per-item failures go to the fault bus and never stop the stream
//! - a status summary is handed to the status updater once the stream closes

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use keepsake_common::{
    Bus, FaultError, FaultItem, ItemPath, LocalBus, LABEL_FORCE_NO_BACKUP_CREATION,
};

use crate::config::{Options, Parallelism};
use crate::count::{CountKey, Counter};
use crate::item::{Item, ItemSource};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::status::{CollectionMetrics, CollectionStatus, Operation, StatusUpdater};

/// One tick per emitted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressTick {
    pub item_id: String,
}

#[derive(Default)]
struct Tally {
    successes: AtomicUsize,
    bytes: AtomicI64,
}

/// Items of one container, streamed from a remote source.
pub struct Collection {
    container_id: String,
    full_path: ItemPath,
    location: ItemPath,
    source: ItemSource,
    added: BTreeSet<String>,
    removed: BTreeSet<String>,
    parallelism: Parallelism,
    retry: RetryExecutor,
    status_updater: Arc<dyn StatusUpdater>,
    progress: Option<mpsc::UnboundedSender<ProgressTick>>,
    counter: Counter,
}

impl Collection {
    /// Create an empty collection.
    ///
    /// `full_path` is where the items are stored; `location` is the
    /// human-readable container path recorded as each item's parent path.
    pub fn new(
        container_id: impl Into<String>,
        full_path: ItemPath,
        location: ItemPath,
        source: ItemSource,
        status_updater: Arc<dyn StatusUpdater>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            full_path,
            location,
            source,
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
            parallelism: Parallelism::default(),
            retry: RetryExecutor::new(RetryConfig::default()),
            status_updater,
            progress: None,
            counter: Counter::new(),
        }
    }

    /// Ids to fetch. An id also listed as removed is dropped from removed.
    pub fn with_added<I: IntoIterator<Item = String>>(mut self, ids: I) -> Self {
        for id in ids {
            self.removed.remove(&id);
            self.added.insert(id);
        }
        self
    }

    /// Ids to emit tombstones for. An id also listed as added is dropped from added.
    pub fn with_removed<I: IntoIterator<Item = String>>(mut self, ids: I) -> Self {
        for id in ids {
            self.added.remove(&id);
            self.removed.insert(id);
        }
        self
    }

    pub fn with_options(mut self, options: &Options) -> Self {
        self.parallelism = options.parallelism;
        self.retry = RetryExecutor::new(options.retry.to_retry_config());
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(config);
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ProgressTick>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_counter(mut self, counter: Counter) -> Self {
        self.counter = counter;
        self
    }

    pub fn full_path(&self) -> &ItemPath {
        &self.full_path
    }

    pub fn location(&self) -> &ItemPath {
        &self.location
    }

    /// Number of records the stream will attempt.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start streaming. The receiver closes once every item has been
    /// handled and the status updater has been called.
    pub fn items(self: Arc<Self>, bus: Bus) -> mpsc::Receiver<Item> {
        let (tx, rx) = mpsc::channel(self.parallelism.collection_buffer.max(1));
        tokio::spawn(self.stream_items(tx, bus));
        rx
    }

    #[instrument(
        skip_all,
        fields(
            container = %self.container_id,
            service = self.source.service(),
            added = self.added.len(),
            removed = self.removed.len()
        )
    )]
    async fn stream_items(self: Arc<Self>, tx: mpsc::Sender<Item>, bus: Bus) {
        let tally = Arc::new(Tally::default());
        let errs = bus.local();

        debug!("Streaming collection {}", self.full_path);

        for id in &self.removed {
            if tx.send(Item::tombstone(id.clone())).await.is_err() {
                warn!("Item stream receiver dropped, stopping collection");
                break;
            }
            tally.successes.fetch_add(1, Ordering::Relaxed);
            self.counter.inc(CountKey::TombstonesEmitted);
            self.tick(id);
        }

        let semaphore = Arc::new(Semaphore::new(self.parallelism.item_fetch.max(1)));
        let mut tasks = JoinSet::new();

        for id in &self.added {
            if bus.failure().is_some() || tx.is_closed() {
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if bus.failure().is_some() || tx.is_closed() {
                debug!("Not fetching remaining items");
                break;
            }

            let this = self.clone();
            let tx = tx.clone();
            let errs = errs.clone();
            let tally = tally.clone();
            let id = id.clone();

            tasks.spawn(async move {
                this.fetch_one(&id, &tx, &errs, &tally).await;
                drop(permit);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Item fetch task failed: {}", e);
            }
        }

        let status = CollectionStatus {
            operation: Operation::Backup,
            folder: self.location.to_string_path(),
            metrics: CollectionMetrics {
                objects: self.len(),
                successes: tally.successes.load(Ordering::Relaxed),
                bytes: tally.bytes.load(Ordering::Relaxed),
            },
        };
        info!("Finished collection: {}", status);
        self.status_updater.update(status);

        // Status goes out before the stream closes.
        drop(tx);
    }

    async fn fetch_one(&self, id: &str, tx: &mpsc::Sender<Item>, errs: &LocalBus, tally: &Tally) {
        let fetched = self
            .retry
            .execute("fetching item", || self.source.fetch(&self.container_id, id))
            .await;

        let mut fetched = match fetched {
            Ok(fetched) => fetched,
            Err(err) if err.is_deleted_in_flight() => {
                info!(item_id = %id, "Item deleted in flight, skipping");
                self.counter.inc(CountKey::DeletedInFlight);
                tally.successes.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(err) => {
                errs.add_recoverable(
                    FaultError::from(err)
                        .context("fetching item")
                        .with_label(LABEL_FORCE_NO_BACKUP_CREATION)
                        .with_item(FaultItem::file(&self.container_id, id, id)),
                );
                return;
            }
        };

        if fetched.info.size() <= 0 {
            fetched.info.set_size(fetched.data.len() as i64);
        }
        fetched.info.set_parent_path(self.location.to_string_path());

        let size = fetched.info.size();
        let item = Item {
            id: id.to_string(),
            mod_time: fetched.info.modified(),
            data: Some(fetched.data),
            info: Some(fetched.info),
            deleted: false,
        };

        if tx.send(item).await.is_err() {
            warn!(item_id = %id, "Item stream receiver dropped");
            return;
        }

        tally.successes.fetch_add(1, Ordering::Relaxed);
        tally.bytes.fetch_add(size, Ordering::Relaxed);
        self.counter.inc(CountKey::ItemsRead);
        self.counter.add(CountKey::BytesRead, size);
        self.tick(id);
    }

    fn tick(&self, id: &str) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(ProgressTick {
                item_id: id.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use keepsake_common::{Error, Result};
    use keepsake_remote::{
        ExchangeInfo, ExchangeItemType, ItemGetterSerializer, ItemInfo, MemoryMailbox,
        MemoryRemote, RawItem,
    };
    use parking_lot::Mutex;
    use std::time::Duration;

    use crate::item::DriveSource;
    use crate::status::StatusAggregator;
    use crate::url_cache::UrlCache;

    /// Getter whose behaviour is scripted per item id.
    #[derive(Default)]
    struct ScriptedGetter {
        failing: BTreeSet<String>,
        flaky_once: BTreeSet<String>,
        seen: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl ItemGetterSerializer for ScriptedGetter {
        async fn get_item(&self, _container: &str, item_id: &str) -> Result<(RawItem, ItemInfo)> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let first_try = {
                let mut seen = self.seen.lock();
                let first = !seen.iter().any(|s| s == item_id);
                seen.push(item_id.to_string());
                first
            };
            if self.failing.contains(item_id) {
                return Err(Error::Remote(format!("cannot read {}", item_id)));
            }
            if first_try && self.flaky_once.contains(item_id) {
                return Err(Error::Network("reset".to_string()));
            }

            let info = ItemInfo::Exchange(ExchangeInfo {
                item_type: ExchangeItemType::Mail,
                subject: item_id.to_string(),
                sender: "a@example.com".to_string(),
                size: 0,
                modified: Utc::now(),
                parent_path: String::new(),
            });
            Ok((
                RawItem {
                    id: item_id.to_string(),
                    payload: serde_json::json!({ "id": item_id }),
                },
                info,
            ))
        }

        async fn serialize(&self, item: &RawItem) -> Result<Vec<u8>> {
            Ok(item.id.as_bytes().to_vec())
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn collection(source: ItemSource, status: Arc<StatusAggregator>) -> Collection {
        Collection::new(
            "inbox",
            ItemPath::parse("tenant/exchange/user1/email/inbox").unwrap(),
            ItemPath::parse("Inbox").unwrap(),
            source,
            status,
        )
        .with_retry(
            RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    async fn drain(mut rx: mpsc::Receiver<Item>) -> Vec<Item> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_stream_completeness() {
        let mailbox = MemoryMailbox::new();
        let added: Vec<String> = (0..3)
            .map(|i| mailbox.add_message("inbox", &format!("m{}", i), "a@example.com", "hello"))
            .collect();
        let status = Arc::new(StatusAggregator::new());
        let started = Utc::now();

        let col = Arc::new(
            collection(ItemSource::Exchange(Arc::new(mailbox)), status.clone())
                .with_added(added.clone())
                .with_removed(ids(&["r1", "r2"])),
        );
        let bus = Bus::new(false);
        let items = drain(col.items(bus.clone())).await;

        assert_eq!(items.len(), 5);
        let tombstones: Vec<_> = items.iter().filter(|i| i.deleted).collect();
        assert_eq!(tombstones.len(), 2);
        for t in &tombstones {
            assert!(t.mod_time >= started);
            assert!(t.data.is_none());
        }
        for item in items.iter().filter(|i| !i.deleted) {
            let info = item.info.as_ref().unwrap();
            assert_eq!(info.parent_path(), "/Inbox");
            assert_eq!(info.size(), item.data.as_ref().unwrap().len() as i64);
        }

        let summary = status.summary();
        assert_eq!(summary.folders, 1);
        assert_eq!(summary.metrics.objects, 5);
        assert_eq!(summary.metrics.successes, 5);
        assert!(bus.recovered().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_in_flight_counts_as_success() {
        let mailbox = MemoryMailbox::new();
        let kept = mailbox.add_message("inbox", "kept", "a@example.com", "x");
        let gone = mailbox.add_message("inbox", "gone", "a@example.com", "y");
        mailbox.remove_message("inbox", &gone);
        let status = Arc::new(StatusAggregator::new());
        let counter = Counter::new();

        let col = Arc::new(
            collection(ItemSource::Exchange(Arc::new(mailbox)), status.clone())
                .with_added(vec![kept.clone(), gone])
                .with_counter(counter.clone()),
        );
        let bus = Bus::new(false);
        let items = drain(col.items(bus.clone())).await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, kept);
        assert!(bus.recovered().is_empty());
        assert_eq!(counter.get(CountKey::DeletedInFlight), 1);

        assert_eq!(status.summary().metrics.successes, 2);
    }

    #[tokio::test]
    async fn test_fetch_errors_are_recoverable_and_labeled() {
        let getter = ScriptedGetter {
            failing: ids(&["bad"]).into_iter().collect(),
            ..Default::default()
        };
        let status = Arc::new(StatusAggregator::new());
        let col = Arc::new(
            collection(ItemSource::Exchange(Arc::new(getter)), status.clone())
                .with_added(ids(&["a", "bad", "c"])),
        );
        let bus = Bus::new(false);
        let items = drain(col.items(bus.clone())).await;

        assert_eq!(items.len(), 2);
        assert!(bus.failure().is_none());
        let recovered = bus.recovered();
        assert_eq!(recovered.len(), 1);
        assert!(recovered[0].has_label(LABEL_FORCE_NO_BACKUP_CREATION));
        assert_eq!(recovered[0].item.as_ref().unwrap().id, "bad");
        assert!(recovered[0].message.starts_with("fetching item"));

        let summary = status.summary();
        assert_eq!(summary.metrics.objects, 3);
        assert_eq!(summary.metrics.successes, 2);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_new_fetches() {
        let all: Vec<String> = (0..10).map(|i| format!("i{}", i)).collect();
        let getter = Arc::new(ScriptedGetter {
            failing: all.iter().cloned().collect(),
            ..Default::default()
        });
        let mut options = Options::default();
        options.parallelism.item_fetch = 1;
        options.retry.max_retries = 0;

        let col = Arc::new(
            collection(
                ItemSource::Exchange(getter.clone()),
                Arc::new(StatusAggregator::new()),
            )
            .with_options(&options)
            .with_added(all)
            .with_removed(ids(&["r1"])),
        );
        let bus = Bus::new(true);
        let items = drain(col.items(bus.clone())).await;

        assert_eq!(items.len(), 1);
        assert!(items[0].deleted);
        assert!(bus.failure().is_some());
        assert_eq!(getter.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_new_fetches() {
        let getter = Arc::new(ScriptedGetter::default());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let updater = Arc::new(move |status: CollectionStatus| {
            let _ = done_tx.send(status);
        });

        let all: Vec<String> = (0..10).map(|i| format!("i{}", i)).collect();
        let col = Arc::new(
            Collection::new(
                "inbox",
                ItemPath::parse("tenant/exchange/user1/email/inbox").unwrap(),
                ItemPath::parse("Inbox").unwrap(),
                ItemSource::Exchange(getter.clone()),
                updater,
            )
            .with_added(all),
        );
        drop(col.items(Bus::new(false)));

        let status = done_rx.recv().await.unwrap();
        assert_eq!(status.metrics.objects, 10);
        assert_eq!(status.metrics.successes, 0);
        assert!(getter.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let getter = ScriptedGetter {
            flaky_once: ids(&["a"]).into_iter().collect(),
            ..Default::default()
        };
        let col = Arc::new(
            collection(
                ItemSource::Exchange(Arc::new(getter)),
                Arc::new(StatusAggregator::new()),
            )
            .with_added(ids(&["a"])),
        );
        let bus = Bus::new(false);
        let items = drain(col.items(bus.clone())).await;

        assert_eq!(items.len(), 1);
        assert!(bus.recovered().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallelism_is_bounded() {
        let getter = Arc::new(ScriptedGetter {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let mut options = Options::default();
        options.parallelism.item_fetch = 2;

        let col = Arc::new(
            collection(
                ItemSource::Exchange(getter.clone()),
                Arc::new(StatusAggregator::new()),
            )
            .with_options(&options)
            .with_added((0..12).map(|i| format!("i{}", i))),
        );
        let items = drain(col.items(Bus::new(false))).await;

        assert_eq!(items.len(), 12);
        assert!(getter.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_progress_ticks_per_record() {
        let getter = ScriptedGetter::default();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let col = Arc::new(
            collection(
                ItemSource::Exchange(Arc::new(getter)),
                Arc::new(StatusAggregator::new()),
            )
            .with_added(ids(&["a", "b"]))
            .with_removed(ids(&["c"]))
            .with_progress(progress_tx),
        );
        let items = drain(col.clone().items(Bus::new(false))).await;
        drop(col);

        assert_eq!(items.len(), 3);
        let mut ticks = 0;
        while let Some(_tick) = progress_rx.recv().await {
            ticks += 1;
        }
        assert_eq!(ticks, 3);
    }

    #[tokio::test]
    async fn test_drive_collection_with_url_cache() {
        let remote = MemoryRemote::new();
        let drive = remote.add_drive("user1", "OneDrive");
        let root = remote.root_id(&drive.id).unwrap();
        let a = remote.add_file(&drive.id, &root, "a.txt", b"aaaa".to_vec()).unwrap();
        let b = remote.add_file(&drive.id, &root, "b.txt", b"bb".to_vec()).unwrap();
        let c = remote.add_file(&drive.id, &root, "c.txt", b"c".to_vec()).unwrap();
        remote.remove_item(&drive.id, &c.id).unwrap();

        let cache = Arc::new(
            UrlCache::new(
                drive.id.clone(),
                None,
                Duration::from_secs(60),
                Arc::new(remote.file_delta_pager(&drive.id)),
            )
            .unwrap(),
        );
        let source = ItemSource::Drive(DriveSource::new(cache.clone(), Arc::new(remote)));
        let status = Arc::new(StatusAggregator::new());
        let col = Arc::new(
            Collection::new(
                drive.id.clone(),
                ItemPath::parse(&format!("drives/{}/root:", drive.id)).unwrap(),
                ItemPath::parse("OneDrive").unwrap(),
                source,
                status.clone(),
            )
            .with_added(vec![a.id, b.id, c.id]),
        );
        let bus = Bus::new(false);
        let items = drain(col.items(bus.clone())).await;

        assert_eq!(items.len(), 2);
        assert!(bus.recovered().is_empty());
        assert_eq!(cache.delta_query_count(), 1);

        let summary = status.summary();
        assert_eq!(summary.metrics.objects, 3);
        assert_eq!(summary.metrics.successes, 3);
        assert_eq!(summary.metrics.bytes, 6);
    }

    #[test]
    fn test_added_and_removed_overlap() {
        let col = collection(
            ItemSource::Exchange(Arc::new(MemoryMailbox::new())),
            Arc::new(StatusAggregator::new()),
        )
        .with_added(ids(&["x", "y"]))
        .with_removed(ids(&["y"]));

        assert_eq!(col.len(), 2);
    }
}
