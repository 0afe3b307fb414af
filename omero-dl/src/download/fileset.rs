use std::collections::{HashMap, HashSet};

use omero_core::{Fileset, FilesetId, ImageId, Repository, RepositoryError};
use tracing::warn;

use crate::queue::QueueTree;

/// Filesets already written to disk during one run.
#[derive(Debug, Default)]
pub struct FilesetIndex {
    downloaded: HashSet<FilesetId>,
}

impl FilesetIndex {
    pub fn contains(&self, fileset: FilesetId) -> bool {
        self.downloaded.contains(&fileset)
    }

    /// Returns false if the fileset was already recorded.
    pub fn record(&mut self, fileset: FilesetId) -> bool {
        self.downloaded.insert(fileset)
    }

    pub fn len(&self) -> usize {
        self.downloaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downloaded.is_empty()
    }
}

/// Image → fileset lookups, each image asked of the repository once.
pub struct FilesetResolver<'r, R: ?Sized> {
    repo: &'r R,
    cache: HashMap<ImageId, Option<Fileset>>,
}

impl<'r, R> FilesetResolver<'r, R>
where
    R: Repository + ?Sized,
{
    pub fn new(repo: &'r R) -> Self {
        Self {
            repo,
            cache: HashMap::new(),
        }
    }

    /// Fileset owning `image`, or `None` (logged) when the image has none.
    pub async fn fileset_of(&mut self, image: ImageId) -> Result<Option<&Fileset>, RepositoryError> {
        if !self.cache.contains_key(&image) {
            let fileset = self.repo.fileset_of(image).await?;
            if fileset.is_none() {
                warn!(image = %image, "image has no fileset; skipping");
            }
            self.cache.insert(image, fileset);
        }
        Ok(self.cache.get(&image).and_then(Option::as_ref))
    }
}

/// Distinct filesets reachable from the queue, in first-seen order.
///
/// The count is the denominator of overall progress; it differs from the
/// image count whenever images share a fileset.
pub async fn collect_fileset_ids<R>(
    queue: &QueueTree,
    resolver: &mut FilesetResolver<'_, R>,
) -> Result<Vec<FilesetId>, RepositoryError>
where
    R: Repository + ?Sized,
{
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for (_, image) in queue.images() {
        if let Some(fileset) = resolver.fileset_of(image).await? {
            if seen.insert(fileset.id) {
                ordered.push(fileset.id);
            }
        }
    }
    Ok(ordered)
}
