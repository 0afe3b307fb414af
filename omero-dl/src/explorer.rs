//! Step-wise population of the explorer tree from the repository.

use omero_core::{DatasetId, ImageId, Listing, ProjectId, Repository, RepositoryError};
use thiserror::Error;
use tracing::debug;

use crate::hierarchy::{Entity, NodeId, Tree, TreeError};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
}

enum Pending {
    Project(Listing<ProjectId>),
    Dataset(NodeId, Listing<DatasetId>),
    Image(NodeId, Listing<ImageId>),
}

/// Builds a fresh explorer tree one node per step, depth first, listing the
/// children of each container as it is inserted.
pub struct ExplorerLoader<'r, R: ?Sized> {
    repo: &'r R,
    tree: Tree,
    stack: Vec<Pending>,
    started: bool,
}

impl<'r, R> ExplorerLoader<'r, R>
where
    R: Repository + ?Sized,
{
    pub fn new(repo: &'r R) -> Self {
        Self {
            repo,
            tree: Tree::new(),
            stack: Vec::new(),
            started: false,
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Inserts the next node. Returns `Ok(None)` once every project has been
    /// walked.
    pub async fn step(&mut self) -> Result<Option<NodeId>, LoadError> {
        if !self.started {
            self.started = true;
            let projects = self.repo.list_projects().await?;
            debug!(count = projects.len(), "listed projects");
            self.stack
                .extend(projects.into_iter().rev().map(Pending::Project));
        }

        let Some(pending) = self.stack.pop() else {
            return Ok(None);
        };
        let node = match pending {
            Pending::Project(project) => {
                let (node, _) =
                    self.tree
                        .find_or_insert(None, Entity::Project(project.id), project.name)?;
                let datasets = self.repo.list_datasets(project.id).await?;
                self.stack.extend(
                    datasets
                        .into_iter()
                        .rev()
                        .map(|dataset| Pending::Dataset(node, dataset)),
                );
                node
            }
            Pending::Dataset(parent, dataset) => {
                let (node, _) = self.tree.find_or_insert(
                    Some(parent),
                    Entity::Dataset(dataset.id),
                    dataset.name,
                )?;
                let images = self.repo.list_images(dataset.id).await?;
                self.stack.extend(
                    images
                        .into_iter()
                        .rev()
                        .map(|image| Pending::Image(node, image)),
                );
                node
            }
            Pending::Image(parent, image) => {
                let (node, _) =
                    self.tree
                        .find_or_insert(Some(parent), Entity::Image(image.id), image.name)?;
                node
            }
        };
        Ok(Some(node))
    }

    pub fn finish(self) -> Tree {
        self.tree
    }
}

/// Drives an [`ExplorerLoader`] to the end, yielding between nodes.
pub async fn load_explorer<R>(repo: &R) -> Result<Tree, LoadError>
where
    R: Repository + ?Sized,
{
    let mut loader = ExplorerLoader::new(repo);
    while loader.step().await?.is_some() {
        tokio::task::yield_now().await;
    }
    Ok(loader.finish())
}
