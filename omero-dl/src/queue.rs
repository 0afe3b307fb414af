//! Download queue tree and the merge of explorer selections into it.

use std::collections::HashMap;

use omero_core::{
    DatasetId, ImageId, Listing, ProjectId, Repository, RepositoryError,
    is_default_upload_folder,
};
use thiserror::Error;
use tracing::debug;

use crate::hierarchy::{Entity, NodeId, NodeKind, Tree, TreeError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("a {0} cannot be selected for download directly")]
    UnsupportedSelection(NodeKind),
    #[error("{0} has no enclosing {1}")]
    MissingAncestor(NodeId, NodeKind),
}

/// Minimal hierarchy enclosing one explorer selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionPayload {
    pub project: Listing<ProjectId>,
    pub datasets: Vec<DatasetSelection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSelection {
    pub dataset: Listing<DatasetId>,
    pub images: Vec<Listing<ImageId>>,
}

impl SelectionPayload {
    pub fn image_count(&self) -> usize {
        self.datasets.iter().map(|dataset| dataset.images.len()).sum()
    }
}

/// Computes what selecting `selected` in the explorer puts into the queue.
///
/// A project brings its whole current subtree, a dataset brings its project
/// (name and id only) plus all of its images, an image brings its ancestor
/// chain plus itself.
pub fn selection_payload(
    explorer: &Tree,
    selected: NodeId,
) -> Result<SelectionPayload, QueueError> {
    let node = explorer.node(selected)?;
    match node.entity() {
        Entity::Project(id) => Ok(SelectionPayload {
            project: Listing::new(*id, node.name()),
            datasets: node
                .children()
                .iter()
                .filter_map(|child| dataset_selection(explorer, *child))
                .collect(),
        }),
        Entity::Dataset(_) => {
            let project = enclosing_project(explorer, selected)?;
            let dataset = dataset_selection(explorer, selected)
                .ok_or(QueueError::MissingAncestor(selected, NodeKind::Dataset))?;
            Ok(SelectionPayload {
                project,
                datasets: vec![dataset],
            })
        }
        Entity::Image(id) => {
            let dataset_node = explorer
                .ancestor_of_kind(selected, NodeKind::Dataset)
                .ok_or(QueueError::MissingAncestor(selected, NodeKind::Dataset))?;
            let dataset = explorer.node(dataset_node)?;
            let Entity::Dataset(dataset_id) = dataset.entity() else {
                return Err(QueueError::MissingAncestor(selected, NodeKind::Dataset));
            };
            Ok(SelectionPayload {
                project: enclosing_project(explorer, selected)?,
                datasets: vec![DatasetSelection {
                    dataset: Listing::new(*dataset_id, dataset.name()),
                    images: vec![Listing::new(*id, node.name())],
                }],
            })
        }
        Entity::Folder(_) => Err(QueueError::UnsupportedSelection(NodeKind::Folder)),
    }
}

fn enclosing_project(explorer: &Tree, node: NodeId) -> Result<Listing<ProjectId>, QueueError> {
    let project = explorer
        .ancestor_of_kind(node, NodeKind::Project)
        .and_then(|id| explorer.get(id))
        .ok_or(QueueError::MissingAncestor(node, NodeKind::Project))?;
    match project.entity() {
        Entity::Project(id) => Ok(Listing::new(*id, project.name())),
        _ => Err(QueueError::MissingAncestor(node, NodeKind::Project)),
    }
}

fn dataset_selection(explorer: &Tree, dataset: NodeId) -> Option<DatasetSelection> {
    let node = explorer.get(dataset)?;
    let Entity::Dataset(id) = node.entity() else {
        return None;
    };
    let images = explorer
        .descendants(dataset)
        .into_iter()
        .filter_map(|descendant| {
            let image = explorer.get(descendant)?;
            match image.entity() {
                Entity::Image(image_id) => Some(Listing::new(*image_id, image.name())),
                _ => None,
            }
        })
        .collect();
    Some(DatasetSelection {
        dataset: Listing::new(*id, node.name()),
        images,
    })
}

/// Outcome of one merge, used for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub nodes_created: usize,
    pub images_added: usize,
}

/// The user-curated download queue.
///
/// Built only by merging explorer selections; siblings are unique by
/// `(kind, id)` and keep insertion order.
#[derive(Debug, Default)]
pub struct QueueTree {
    tree: Tree,
    projects: HashMap<ProjectId, NodeId>,
}

impl QueueTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Merges the selection rooted at `selected` into the queue.
    pub async fn merge<R>(
        &mut self,
        explorer: &Tree,
        selected: NodeId,
        repo: &R,
    ) -> Result<MergeSummary, QueueError>
    where
        R: Repository + ?Sized,
    {
        let payload = selection_payload(explorer, selected)?;
        self.merge_payload(&payload, repo).await
    }

    /// Merges a precomputed payload.
    ///
    /// Upload folders are resolved before the tree is touched, so a
    /// repository failure leaves the queue unchanged.
    pub async fn merge_payload<R>(
        &mut self,
        payload: &SelectionPayload,
        repo: &R,
    ) -> Result<MergeSummary, QueueError>
    where
        R: Repository + ?Sized,
    {
        let mut placements = Vec::with_capacity(payload.datasets.len());
        for selection in &payload.datasets {
            let mut folders = Vec::with_capacity(selection.images.len());
            for image in &selection.images {
                if self.is_queued_under(payload.project.id, selection.dataset.id, image.id) {
                    folders.push(Placement::Present);
                    continue;
                }
                let folder = repo.upload_folder_of(image.id).await?;
                folders.push(if is_default_upload_folder(&folder) {
                    Placement::Dataset
                } else {
                    Placement::Folder(folder)
                });
            }
            placements.push(folders);
        }

        if payload.datasets.is_empty() {
            debug!(project = %payload.project.id, "selection has no datasets; queue unchanged");
            return Ok(MergeSummary::default());
        }

        let mut summary = MergeSummary::default();
        let project = self.project_node(&payload.project, &mut summary)?;
        for (selection, folders) in payload.datasets.iter().zip(placements) {
            let (dataset, created) = self.tree.find_or_insert(
                Some(project),
                Entity::Dataset(selection.dataset.id),
                selection.dataset.name.clone(),
            )?;
            summary.nodes_created += usize::from(created);

            for (image, placement) in selection.images.iter().zip(folders) {
                let parent = match placement {
                    Placement::Present => continue,
                    Placement::Dataset => dataset,
                    Placement::Folder(name) => {
                        let (folder, created) = self.tree.find_or_insert(
                            Some(dataset),
                            Entity::Folder(name.clone()),
                            name,
                        )?;
                        summary.nodes_created += usize::from(created);
                        folder
                    }
                };
                let (_, created) = self.tree.find_or_insert(
                    Some(parent),
                    Entity::Image(image.id),
                    image.name.clone(),
                )?;
                summary.nodes_created += usize::from(created);
                summary.images_added += usize::from(created);
            }
        }
        debug!(
            project = %payload.project.id,
            nodes = summary.nodes_created,
            images = summary.images_added,
            "merged selection into download queue"
        );
        Ok(summary)
    }

    fn project_node(
        &mut self,
        project: &Listing<ProjectId>,
        summary: &mut MergeSummary,
    ) -> Result<NodeId, QueueError> {
        if let Some(existing) = self.projects.get(&project.id) {
            return Ok(*existing);
        }
        let (node, created) =
            self.tree
                .find_or_insert(None, Entity::Project(project.id), project.name.clone())?;
        summary.nodes_created += usize::from(created);
        self.projects.insert(project.id, node);
        Ok(node)
    }

    fn is_queued_under(&self, project: ProjectId, dataset: DatasetId, image: ImageId) -> bool {
        let Some(project) = self.projects.get(&project) else {
            return false;
        };
        let Some(dataset) = self
            .tree
            .find_child(Some(*project), &Entity::Dataset(dataset))
        else {
            return false;
        };
        let image = Entity::Image(image);
        self.tree.children_of(Some(dataset)).iter().any(|child| {
            self.tree.get(*child).is_some_and(|node| {
                node.entity() == &image
                    || (node.kind() == NodeKind::Folder
                        && self.tree.find_child(Some(*child), &image).is_some())
            })
        })
    }

    /// Removes `node` and everything below it. Returns the number of nodes
    /// dropped.
    pub fn remove(&mut self, node: NodeId) -> Result<usize, QueueError> {
        let (removed, count) = self.tree.remove(node)?;
        if removed.parent().is_none() {
            if let Entity::Project(id) = removed.entity() {
                self.projects.remove(id);
            }
        }
        Ok(count)
    }

    pub fn clear(&mut self) {
        self.tree.clear();
        self.projects.clear();
    }

    /// True when `entity` appears at any of the four queue depths:
    /// project, dataset, folder-or-image, image-under-folder.
    pub fn contains(&self, entity: &Entity) -> bool {
        let tree = &self.tree;
        let is_match = |id: &NodeId| tree.get(*id).is_some_and(|node| node.entity() == entity);
        for project in tree.roots() {
            if is_match(project) {
                return true;
            }
            for dataset in tree.children_of(Some(*project)) {
                if is_match(dataset) {
                    return true;
                }
                for child in tree.children_of(Some(*dataset)) {
                    if is_match(child) {
                        return true;
                    }
                    for image in tree.children_of(Some(*child)) {
                        if is_match(image) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Every queued image reachable through datasets and optional folders,
    /// in download order.
    pub fn images(&self) -> Vec<(NodeId, ImageId)> {
        self.tree
            .walk()
            .into_iter()
            .filter_map(|id| match self.tree.get(id)?.entity() {
                Entity::Image(image) => Some((id, *image)),
                _ => None,
            })
            .collect()
    }
}

enum Placement {
    Present,
    Dataset,
    Folder(String),
}
