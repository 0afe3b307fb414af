use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use omero_core::{ChunkStream, FilesetId, ImageId, OriginalFile, Repository, RepositoryError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::fileset::{FilesetIndex, FilesetResolver, collect_fileset_ids};
use super::progress::{DownloadProgressState, ProgressObserver};
use crate::hierarchy::{Entity, NodeId, Tree};
use crate::paths::{NameAllocator, PathError, PathOwner, destination_root};
use crate::queue::QueueTree;
use crate::session::BusyGuard;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("failed to create directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to write {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("download cancelled")]
    Cancelled,
}

/// One unit of work performed by [`DownloadRun::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    DirectoryCreated(PathBuf),
    Chunk { done: u64, total: u64 },
    FileCompleted(PathBuf),
    FilesetCompleted {
        fileset: FilesetId,
        completed: usize,
        total: usize,
    },
    Finished,
}

#[derive(Debug)]
enum Task {
    CreateDir(PathBuf),
    Image { image: ImageId, dir: PathBuf },
}

struct ActiveFileset {
    id: FilesetId,
    dir: PathBuf,
    pending: VecDeque<OriginalFile>,
    file: Option<ActiveFile>,
}

struct ActiveFile {
    path: PathBuf,
    size: u64,
    written: u64,
    out: tokio::fs::File,
    stream: ChunkStream,
}

/// A single pass over the download queue, advanced one unit at a time.
///
/// Each call to [`step`](Self::step) creates one directory or writes one
/// chunk and then returns, so the caller's event loop stays responsive.
/// The run is finite and cannot be restarted: after `Finished`, an error or
/// a cancellation every further step yields `Ok(None)`.
pub struct DownloadRun<'r, R: ?Sized> {
    repo: &'r R,
    resolver: FilesetResolver<'r, R>,
    tasks: VecDeque<Task>,
    active: Option<ActiveFileset>,
    index: FilesetIndex,
    names: NameAllocator,
    progress: DownloadProgressState,
    observer: Option<Box<dyn ProgressObserver>>,
    cancel: CancellationToken,
    finished: bool,
    guard: Option<BusyGuard>,
}

impl<'r, R> DownloadRun<'r, R>
where
    R: Repository + ?Sized,
{
    /// Lays out the destination tree for `queue` and counts the distinct
    /// filesets to transfer. Creates `destination` if it is missing.
    pub async fn prepare(
        queue: &QueueTree,
        repo: &'r R,
        destination: &Path,
    ) -> Result<Self, DownloadError> {
        let root = destination_root(destination)?;
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| DownloadError::CreateDir {
                path: root.clone(),
                source,
            })?;

        let mut names = NameAllocator::new();
        let tasks = plan(queue.tree(), &root, &mut names);
        let mut resolver = FilesetResolver::new(repo);
        let filesets = collect_fileset_ids(queue, &mut resolver).await?;
        info!(
            destination = %root.display(),
            filesets = filesets.len(),
            "prepared download run"
        );

        Ok(Self {
            repo,
            resolver,
            tasks,
            active: None,
            index: FilesetIndex::default(),
            names,
            progress: DownloadProgressState {
                overall_total: filesets.len(),
                ..DownloadProgressState::default()
            },
            observer: None,
            cancel: CancellationToken::new(),
            finished: false,
            guard: None,
        })
    }

    pub fn with_observer(mut self, mut observer: Box<dyn ProgressObserver>) -> Self {
        observer.on_overall_progress(self.progress.overall_completed, self.progress.overall_total);
        self.observer = Some(observer);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub(crate) fn with_guard(mut self, guard: BusyGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> DownloadProgressState {
        self.progress
    }

    pub fn fileset_index(&self) -> &FilesetIndex {
        &self.index
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Performs the next unit of work.
    ///
    /// Returns `Ok(None)` once the run is exhausted. Errors are fatal: the
    /// run stops and files already written stay on disk.
    pub async fn step(&mut self) -> Result<Option<Tick>, DownloadError> {
        if self.finished {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            info!(
                completed = self.progress.overall_completed,
                total = self.progress.overall_total,
                "download run cancelled"
            );
            self.finish();
            return Err(DownloadError::Cancelled);
        }
        match self.advance().await {
            Ok(tick) => {
                if tick == Tick::Finished {
                    info!(filesets = self.progress.overall_completed, "download run finished");
                    self.finish();
                }
                Ok(Some(tick))
            }
            Err(err) => {
                self.finish();
                Err(err)
            }
        }
    }

    /// Steps until exhaustion, yielding to the executor between steps.
    pub async fn run_to_end(&mut self) -> Result<DownloadProgressState, DownloadError> {
        while let Some(tick) = self.step().await? {
            trace!(?tick, "download step");
            tokio::task::yield_now().await;
        }
        Ok(self.progress)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.active = None;
        self.tasks.clear();
        self.guard.take();
    }

    async fn advance(&mut self) -> Result<Tick, DownloadError> {
        loop {
            if let Some(active) = self.active.as_mut() {
                if let Some(file) = active.file.as_mut() {
                    match file.stream.next().await {
                        Some(chunk) => {
                            let chunk = chunk?;
                            file.out
                                .write_all(&chunk)
                                .await
                                .map_err(|source| DownloadError::Write {
                                    path: file.path.clone(),
                                    source,
                                })?;
                            file.written += chunk.len() as u64;
                            self.progress.current_file_bytes_done = file.written;
                            if let Some(observer) = self.observer.as_mut() {
                                observer.on_file_progress(file.written, file.size);
                            }
                            return Ok(Tick::Chunk {
                                done: file.written,
                                total: file.size,
                            });
                        }
                        None => {
                            let path = file.path.clone();
                            let write_error = |source| DownloadError::Write {
                                path: path.clone(),
                                source,
                            };
                            file.out.flush().await.map_err(write_error)?;
                            file.out.sync_all().await.map_err(write_error)?;
                            active.file = None;
                            debug!(path = %path.display(), "file written");
                            return Ok(Tick::FileCompleted(path));
                        }
                    }
                }

                if let Some(meta) = active.pending.pop_front() {
                    let path = self
                        .names
                        .claim(&active.dir, &meta.name, PathOwner::File(meta.id));
                    let out = tokio::fs::File::create(&path)
                        .await
                        .map_err(|source| DownloadError::Write {
                            path: path.clone(),
                            source,
                        })?;
                    let stream = self.repo.open_file(&meta).await?;
                    self.progress.current_file_bytes_done = 0;
                    self.progress.current_file_bytes_total = meta.size;
                    if let Some(observer) = self.observer.as_mut() {
                        observer.on_file_progress(0, meta.size);
                    }
                    active.file = Some(ActiveFile {
                        path,
                        size: meta.size,
                        written: 0,
                        out,
                        stream,
                    });
                    continue;
                }

                let fileset = active.id;
                self.active = None;
                self.index.record(fileset);
                self.progress.overall_completed += 1;
                if let Some(observer) = self.observer.as_mut() {
                    observer.on_overall_progress(
                        self.progress.overall_completed,
                        self.progress.overall_total,
                    );
                }
                return Ok(Tick::FilesetCompleted {
                    fileset,
                    completed: self.progress.overall_completed,
                    total: self.progress.overall_total,
                });
            }

            let Some(task) = self.tasks.pop_front() else {
                return Ok(Tick::Finished);
            };
            match task {
                Task::CreateDir(dir) => {
                    tokio::fs::create_dir_all(&dir)
                        .await
                        .map_err(|source| DownloadError::CreateDir {
                            path: dir.clone(),
                            source,
                        })?;
                    debug!(path = %dir.display(), "directory ready");
                    return Ok(Tick::DirectoryCreated(dir));
                }
                Task::Image { image, dir } => {
                    let Some(fileset) = self.resolver.fileset_of(image).await? else {
                        continue;
                    };
                    if self.index.contains(fileset.id) {
                        debug!(image = %image, fileset = %fileset.id, "fileset already downloaded");
                        continue;
                    }
                    self.active = Some(ActiveFileset {
                        id: fileset.id,
                        dir,
                        pending: fileset.files.iter().cloned().collect(),
                        file: None,
                    });
                }
            }
        }
    }
}

/// Depth-first list of directory creations and image visits mirroring the
/// queue tree.
fn plan(tree: &Tree, root: &Path, names: &mut NameAllocator) -> VecDeque<Task> {
    let mut dirs: HashMap<NodeId, PathBuf> = HashMap::new();
    let mut tasks = VecDeque::new();
    for id in tree.walk() {
        let Some(node) = tree.get(id) else {
            continue;
        };
        let parent_dir = node
            .parent()
            .and_then(|parent| dirs.get(&parent))
            .map_or(root, PathBuf::as_path)
            .to_path_buf();
        match node.entity() {
            Entity::Project(_) | Entity::Dataset(_) | Entity::Folder(_) => {
                let dir = names.claim(&parent_dir, node.name(), PathOwner::Node(id));
                dirs.insert(id, dir.clone());
                tasks.push_back(Task::CreateDir(dir));
            }
            Entity::Image(image) => tasks.push_back(Task::Image {
                image: *image,
                dir: parent_dir,
            }),
        }
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use omero_core::{DatasetId, Fileset, Listing, MemoryRepository, ProjectId};
    use tempfile::tempdir;

    fn explorer_p1_d1(images: &[i64]) -> Tree {
        let mut tree = Tree::new();
        let (project, _) = tree
            .find_or_insert(None, Entity::Project(ProjectId(1)), "P1")
            .unwrap();
        let (dataset, _) = tree
            .find_or_insert(Some(project), Entity::Dataset(DatasetId(1)), "D1")
            .unwrap();
        for id in images {
            tree.find_or_insert(Some(dataset), Entity::Image(ImageId(*id)), format!("I{id}"))
                .unwrap();
        }
        tree
    }

    /// Serves everything from `inner`, except that the file named `broken`
    /// fails after its first chunk.
    struct BrokenStream {
        inner: MemoryRepository,
        broken: &'static str,
    }

    #[async_trait]
    impl Repository for BrokenStream {
        async fn list_projects(&self) -> Result<Vec<Listing<ProjectId>>, RepositoryError> {
            self.inner.list_projects().await
        }

        async fn list_datasets(
            &self,
            project: ProjectId,
        ) -> Result<Vec<Listing<DatasetId>>, RepositoryError> {
            self.inner.list_datasets(project).await
        }

        async fn list_images(
            &self,
            dataset: DatasetId,
        ) -> Result<Vec<Listing<ImageId>>, RepositoryError> {
            self.inner.list_images(dataset).await
        }

        async fn upload_folder_of(&self, image: ImageId) -> Result<String, RepositoryError> {
            self.inner.upload_folder_of(image).await
        }

        async fn fileset_of(&self, image: ImageId) -> Result<Option<Fileset>, RepositoryError> {
            self.inner.fileset_of(image).await
        }

        async fn open_file(&self, file: &OriginalFile) -> Result<ChunkStream, RepositoryError> {
            if file.name != self.broken {
                return self.inner.open_file(file).await;
            }
            let chunks = vec![
                Ok(Bytes::from_static(b"part")),
                Err(RepositoryError::Stream("connection reset".into())),
            ];
            Ok(stream::iter(chunks).boxed())
        }
    }

    async fn queue_all(tree: &Tree, repo: &MemoryRepository) -> QueueTree {
        let mut queue = QueueTree::new();
        queue.merge(tree, tree.roots()[0], repo).await.unwrap();
        queue
    }

    async fn drain<R: Repository + ?Sized>(run: &mut DownloadRun<'_, R>) -> Vec<Tick> {
        let mut ticks = Vec::new();
        while let Some(tick) = run.step().await.unwrap() {
            ticks.push(tick);
        }
        ticks
    }

    #[derive(Clone, Default)]
    struct Recorder {
        overall: Arc<Mutex<Vec<(usize, usize)>>>,
        file: Arc<Mutex<Vec<(u64, u64)>>>,
    }

    impl ProgressObserver for Recorder {
        fn on_overall_progress(&mut self, done: usize, total: usize) {
            self.overall.lock().unwrap().push((done, total));
        }

        fn on_file_progress(&mut self, done: u64, total: u64) {
            self.file.lock().unwrap().push((done, total));
        }
    }

    #[tokio::test]
    async fn shared_fileset_is_written_once() {
        let tree = explorer_p1_d1(&[1, 2]);
        let mut repo = MemoryRepository::new().with_chunk_size(3);
        repo.link_fileset(1, 7)
            .link_fileset(2, 7)
            .add_file(7, "stack.tif", b"abcdefg");
        let queue = queue_all(&tree, &repo).await;
        let dir = tempdir().unwrap();

        let recorder = Recorder::default();
        let mut run = DownloadRun::prepare(&queue, &repo, dir.path())
            .await
            .unwrap()
            .with_observer(Box::new(recorder.clone()));
        let ticks = drain(&mut run).await;

        let root = dir.path().to_path_buf();
        assert_eq!(
            ticks,
            vec![
                Tick::DirectoryCreated(root.join("P1")),
                Tick::DirectoryCreated(root.join("P1/D1")),
                Tick::Chunk { done: 3, total: 7 },
                Tick::Chunk { done: 6, total: 7 },
                Tick::Chunk { done: 7, total: 7 },
                Tick::FileCompleted(root.join("P1/D1/stack.tif")),
                Tick::FilesetCompleted {
                    fileset: FilesetId(7),
                    completed: 1,
                    total: 1
                },
                Tick::Finished,
            ]
        );
        assert_eq!(repo.opened_files().len(), 1);
        assert_eq!(
            std::fs::read(root.join("P1/D1/stack.tif")).unwrap(),
            b"abcdefg"
        );
        assert_eq!(run.progress().overall_completed, 1);
        assert_eq!(run.progress().overall_total, 1);
        assert_eq!(*recorder.overall.lock().unwrap(), vec![(0, 1), (1, 1)]);
        assert_eq!(
            *recorder.file.lock().unwrap(),
            vec![(0, 7), (3, 7), (6, 7), (7, 7)]
        );
        assert!(run.step().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn folder_layer_and_multi_file_filesets_land_on_disk() {
        let tree = explorer_p1_d1(&[1, 2]);
        let mut repo = MemoryRepository::new();
        repo.set_upload_folder(2, "plate-3")
            .link_fileset(1, 10)
            .link_fileset(2, 11)
            .add_file(10, "a.tif", b"a")
            .add_file(11, "b.ome.tiff", b"bb")
            .add_file(11, "b.companion.ome", b"");
        let queue = queue_all(&tree, &repo).await;
        let dir = tempdir().unwrap();

        let mut run = DownloadRun::prepare(&queue, &repo, dir.path())
            .await
            .unwrap();
        let state = run.run_to_end().await.unwrap();

        let dataset = dir.path().join("P1/D1");
        assert_eq!(std::fs::read(dataset.join("a.tif")).unwrap(), b"a");
        assert_eq!(
            std::fs::read(dataset.join("plate-3/b.ome.tiff")).unwrap(),
            b"bb"
        );
        assert!(dataset.join("plate-3/b.companion.ome").exists());
        assert_eq!(state.overall_completed, 2);
        assert_eq!(state.overall_total, 2);
    }

    #[tokio::test]
    async fn image_without_fileset_is_skipped() {
        let tree = explorer_p1_d1(&[1, 2]);
        let mut repo = MemoryRepository::new();
        repo.link_fileset(2, 3).add_file(3, "x.tif", b"xy");
        let queue = queue_all(&tree, &repo).await;
        let dir = tempdir().unwrap();

        let mut run = DownloadRun::prepare(&queue, &repo, dir.path())
            .await
            .unwrap();
        let state = run.run_to_end().await.unwrap();

        assert_eq!(state.overall_total, 1);
        assert_eq!(state.overall_completed, 1);
        assert!(dir.path().join("P1/D1/x.tif").exists());
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let tree = explorer_p1_d1(&[1]);
        let mut repo = MemoryRepository::new().with_chunk_size(1);
        repo.link_fileset(1, 1).add_file(1, "big.raw", b"0123456789");
        let queue = queue_all(&tree, &repo).await;
        let dir = tempdir().unwrap();

        let mut run = DownloadRun::prepare(&queue, &repo, dir.path())
            .await
            .unwrap();
        let token = run.cancellation_token();
        for _ in 0..3 {
            run.step().await.unwrap();
        }
        token.cancel();

        assert!(matches!(run.step().await, Err(DownloadError::Cancelled)));
        assert!(run.is_finished());
        assert!(run.step().await.unwrap().is_none());
        assert_eq!(run.progress().overall_completed, 0);
    }

    #[tokio::test]
    async fn directory_creation_failure_is_fatal() {
        let tree = explorer_p1_d1(&[1]);
        let mut repo = MemoryRepository::new();
        repo.link_fileset(1, 1).add_file(1, "a.tif", b"abc");
        let queue = queue_all(&tree, &repo).await;
        let dir = tempdir().unwrap();
        // A plain file where the project directory should go.
        std::fs::write(dir.path().join("P1"), b"not a directory").unwrap();

        let mut run = DownloadRun::prepare(&queue, &repo, dir.path())
            .await
            .unwrap();
        let err = run.run_to_end().await.unwrap_err();

        assert!(matches!(err, DownloadError::CreateDir { .. }));
        assert!(run.is_finished());
    }

    #[tokio::test]
    async fn stream_failure_halts_the_run_and_keeps_written_files() {
        let tree = explorer_p1_d1(&[1, 2]);
        let mut inner = MemoryRepository::new();
        inner
            .link_fileset(1, 1)
            .add_file(1, "done.tif", b"complete")
            .link_fileset(2, 2)
            .add_file(2, "cut.tif", b"never fully arrives");
        let repo = BrokenStream {
            inner,
            broken: "cut.tif",
        };
        let queue = {
            let mut queue = QueueTree::new();
            queue.merge(&tree, tree.roots()[0], &repo).await.unwrap();
            queue
        };
        let dir = tempdir().unwrap();

        let mut run = DownloadRun::prepare(&queue, &repo, dir.path())
            .await
            .unwrap();
        let err = run.run_to_end().await.unwrap_err();

        assert!(matches!(
            err,
            DownloadError::Repository(RepositoryError::Stream(_))
        ));
        let dataset = dir.path().join("P1/D1");
        assert_eq!(std::fs::read(dataset.join("done.tif")).unwrap(), b"complete");
        assert!(dataset.join("cut.tif").exists());
        assert_eq!(run.progress().overall_completed, 1);
        assert!(run.is_finished());
        assert!(run.step().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn existing_directories_are_reused() {
        let tree = explorer_p1_d1(&[1]);
        let mut repo = MemoryRepository::new();
        repo.link_fileset(1, 1).add_file(1, "a.tif", b"fresh");
        let queue = queue_all(&tree, &repo).await;
        let dir = tempdir().unwrap();
        let dataset = dir.path().join("P1/D1");
        std::fs::create_dir_all(&dataset).unwrap();
        std::fs::write(dataset.join("notes.txt"), b"keep me").unwrap();

        let mut run = DownloadRun::prepare(&queue, &repo, dir.path())
            .await
            .unwrap();
        let state = run.run_to_end().await.unwrap();

        assert_eq!(state.overall_completed, 1);
        assert_eq!(std::fs::read(dataset.join("a.tif")).unwrap(), b"fresh");
        assert_eq!(std::fs::read(dataset.join("notes.txt")).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn colliding_display_names_get_distinct_directories() {
        let mut tree = Tree::new();
        let (project, _) = tree
            .find_or_insert(None, Entity::Project(ProjectId(1)), "P1")
            .unwrap();
        for id in [1, 2] {
            let (dataset, _) = tree
                .find_or_insert(Some(project), Entity::Dataset(DatasetId(id)), "Day 1")
                .unwrap();
            tree.find_or_insert(Some(dataset), Entity::Image(ImageId(id)), "img")
                .unwrap();
        }
        let mut repo = MemoryRepository::new();
        repo.link_fileset(1, 1)
            .add_file(1, "a.tif", b"1")
            .link_fileset(2, 2)
            .add_file(2, "a.tif", b"2");
        let queue = queue_all(&tree, &repo).await;
        let dir = tempdir().unwrap();

        let mut run = DownloadRun::prepare(&queue, &repo, dir.path())
            .await
            .unwrap();
        run.run_to_end().await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("P1/Day 1/a.tif")).unwrap(), b"1");
        assert_eq!(
            std::fs::read(dir.path().join("P1/Day 1 (2)/a.tif")).unwrap(),
            b"2"
        );
    }

    #[tokio::test]
    async fn empty_queue_finishes_immediately() {
        let repo = MemoryRepository::new();
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/out");

        let mut run = DownloadRun::prepare(&QueueTree::new(), &repo, &target)
            .await
            .unwrap();

        assert!(target.is_dir());
        assert_eq!(run.step().await.unwrap(), Some(Tick::Finished));
        assert!(run.step().await.unwrap().is_none());
    }
}
