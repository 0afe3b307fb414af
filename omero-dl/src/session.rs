//! Explorer, queue and highlight state shared by one host.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use omero_core::Repository;
use thiserror::Error;
use tracing::info;

use crate::download::{DownloadError, DownloadRun};
use crate::hierarchy::{Entity, NodeId, Tree};
use crate::highlight::{Highlights, reconcile};
use crate::queue::{MergeSummary, QueueError, QueueTree};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a download is in progress")]
    Busy,
    #[error("{0} is not in the explorer")]
    UnknownEntity(Entity),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// Clears the busy flag when dropped.
#[derive(Debug)]
pub struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns the explorer tree, the download queue and the highlight map.
///
/// Highlights are reconciled after every change to either tree. While a
/// download run is alive the session refuses mutations.
#[derive(Debug, Default)]
pub struct Session {
    explorer: Tree,
    queue: QueueTree,
    highlights: Highlights,
    busy: Arc<AtomicBool>,
}

impl Session {
    pub fn new(explorer: Tree) -> Self {
        let mut session = Self {
            explorer,
            ..Self::default()
        };
        session.reconcile();
        session
    }

    pub fn explorer(&self) -> &Tree {
        &self.explorer
    }

    pub fn queue(&self) -> &QueueTree {
        &self.queue
    }

    pub fn highlights(&self) -> &Highlights {
        &self.highlights
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Swaps in a freshly loaded explorer. The queue is cleared since its
    /// contents belong to the previous context.
    pub fn replace_explorer(&mut self, explorer: Tree) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.explorer = explorer;
        self.queue.clear();
        self.reconcile();
        Ok(())
    }

    pub async fn select<R>(&mut self, node: NodeId, repo: &R) -> Result<MergeSummary, SessionError>
    where
        R: Repository + ?Sized,
    {
        self.ensure_idle()?;
        let summary = self.queue.merge(&self.explorer, node, repo).await?;
        self.reconcile();
        Ok(summary)
    }

    /// Selects the explorer node carrying `entity`.
    pub async fn select_entity<R>(
        &mut self,
        entity: &Entity,
        repo: &R,
    ) -> Result<MergeSummary, SessionError>
    where
        R: Repository + ?Sized,
    {
        let node = self
            .explorer
            .find(entity)
            .ok_or_else(|| SessionError::UnknownEntity(entity.clone()))?;
        self.select(node, repo).await
    }

    /// Removes a queue node and its subtree.
    pub fn remove(&mut self, node: NodeId) -> Result<usize, SessionError> {
        self.ensure_idle()?;
        let removed = self.queue.remove(node)?;
        self.reconcile();
        Ok(removed)
    }

    /// Prepares a run over the current queue and marks the session busy
    /// until the run finishes or is dropped.
    pub async fn start_download<'r, R>(
        &self,
        repo: &'r R,
        destination: &Path,
    ) -> Result<DownloadRun<'r, R>, SessionError>
    where
        R: Repository + ?Sized,
    {
        let guard = BusyGuard::acquire(&self.busy).ok_or(SessionError::Busy)?;
        let run = DownloadRun::prepare(&self.queue, repo, destination).await?;
        Ok(run.with_guard(guard))
    }

    /// Empties the queue after a completed run.
    pub fn finish_download(&mut self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.queue.clear();
        self.reconcile();
        info!("download queue cleared");
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.is_busy() {
            return Err(SessionError::Busy);
        }
        Ok(())
    }

    fn reconcile(&mut self) {
        self.highlights = reconcile(&self.explorer, &self.queue);
    }
}
