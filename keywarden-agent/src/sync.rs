//! Synchronization engine: keeps the local cache convergent with the
//! server using the opaque revision token and a three-way diff on the
//! item list.
//!
//! A single background worker serves both the interval ticker and the
//! force channel, so at most one cycle runs at a time. A forced sync with
//! wait receives exactly one completion notification per request, on
//! success, error and panic paths alike.

use crate::cache::{Cache, CacheEntry};
use crate::client::RemoteVault;
use crate::{AgentError, Result};
use futures::FutureExt;
use keywarden_core::proto;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// User-visible status line values.
pub const STATUS_SYNCING: &str = "Syncing...";
pub const STATUS_SYNCED: &str = "Synced";
pub const STATUS_ERROR: &str = "Sync error";

struct SyncRequest {
    /// Present for wait-for-complete requests; signalled exactly once.
    done: Option<oneshot::Sender<()>>,
}

/// Handle for forcing synchronization from other tasks.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncRequest>,
}

impl SyncHandle {
    /// Enqueue a sync; the caller does not wait.
    pub fn force_background(&self) {
        let _ = self.tx.try_send(SyncRequest { done: None });
    }

    /// Enqueue a sync and block until the engine has attempted one full
    /// cycle, whether it succeeded or failed.
    pub async fn force_and_wait(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(SyncRequest {
                done: Some(done_tx),
            })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

/// The id sets a sync cycle has to apply.
#[derive(Debug, Default, PartialEq)]
pub struct SyncPlan {
    pub create: Vec<i64>,
    pub update: Vec<i64>,
    pub delete: Vec<i64>,
}

/// Compute the three disjoint id sets from the server and cache listings.
///
/// Ids only on the server are created locally, ids on both sides with a
/// differing hash are updated, ids only in the cache are deleted.
pub fn plan_sync(server: &[proto::ItemSummary], local: &[CacheEntry]) -> SyncPlan {
    let mut remote: HashMap<i64, &proto::ItemSummary> =
        server.iter().map(|item| (item.id, item)).collect();

    let mut plan = SyncPlan::default();

    for entry in local {
        match remote.remove(&entry.id) {
            None => plan.delete.push(entry.id),
            Some(item) if item.hash != entry.hash => plan.update.push(entry.id),
            Some(_) => {}
        }
    }

    plan.create = remote.into_keys().collect();
    plan.create.sort_unstable();
    plan
}

/// Background worker driving the cache convergence loop.
pub struct SyncEngine<R: RemoteVault> {
    remote: Arc<R>,
    cache: Cache,
    status_tx: mpsc::Sender<&'static str>,
}

impl<R: RemoteVault + 'static> SyncEngine<R> {
    pub fn new(remote: Arc<R>, cache: Cache, status_tx: mpsc::Sender<&'static str>) -> Self {
        Self {
            remote,
            cache,
            status_tx,
        }
    }

    /// Spawn the worker loop and return the force handle.
    pub fn start(self, interval: Duration, cancel: CancellationToken) -> SyncHandle {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(self.run(interval, rx, cancel));
        SyncHandle { tx }
    }

    async fn run(
        self,
        interval: Duration,
        mut requests: mpsc::Receiver<SyncRequest>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                Some(request) = requests.recv() => {
                    self.run_cycle().await;
                    if let Some(done) = request.done {
                        let _ = done.send(());
                    }
                }
            }
        }
    }

    async fn run_cycle(&self) {
        let _ = self.status_tx.try_send(STATUS_SYNCING);

        // A panic inside a cycle must not kill the worker: wait-for-complete
        // callers would block forever on the completion signal.
        match AssertUnwindSafe(self.sync_once()).catch_unwind().await {
            Ok(Ok(())) => {
                let _ = self.status_tx.try_send(STATUS_SYNCED);
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "sync cycle failed");
                let _ = self.status_tx.try_send(STATUS_ERROR);
            }
            Err(_) => {
                tracing::error!("sync cycle panicked");
                let _ = self.status_tx.try_send(STATUS_ERROR);
            }
        }
    }

    /// Run one convergence cycle.
    ///
    /// Any step error aborts the whole cycle; the revision is only saved
    /// after every item mutation has been applied.
    pub async fn sync_once(&self) -> Result<()> {
        let server_revision = self.remote.get_revision().await?;
        let local_revision = self.cache.get_revision()?;
        if server_revision == local_revision {
            return Ok(());
        }

        let server_list = self.remote.get_item_list().await?;
        let local_list = self.cache.get_items_list()?;
        let plan = plan_sync(&server_list, &local_list);

        if !plan.create.is_empty() || !plan.update.is_empty() {
            let mut wanted: Vec<i64> = Vec::with_capacity(plan.create.len() + plan.update.len());
            wanted.extend(&plan.create);
            wanted.extend(&plan.update);

            let items = self.remote.get_items(&wanted).await?;
            let create_set: HashSet<i64> = plan.create.iter().copied().collect();

            let mut to_create = Vec::new();
            let mut to_update = Vec::new();
            for item in &items {
                let entry = entry_from_item(item)?;
                if create_set.contains(&item.id) {
                    to_create.push(entry);
                } else {
                    to_update.push(entry);
                }
            }

            self.cache.create_items(&to_create)?;
            self.cache.update_items(&to_update)?;
        }

        if !plan.delete.is_empty() {
            self.cache.delete_items(&plan.delete)?;
        }

        self.cache.save_revision(&server_revision)?;
        Ok(())
    }
}

/// Serialize a wire item into its cache row. Sealed fields stay sealed.
fn entry_from_item(item: &proto::Item) -> Result<CacheEntry> {
    Ok(CacheEntry {
        id: item.id,
        name: item.name.clone(),
        item_type: item.item_type.clone(),
        hash: item.hash.clone(),
        data: serde_json::to_vec(item).map_err(AgentError::Serialization)?,
    })
}
