//! In-memory repository used by tests of the queue and download engine.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;

use crate::model::{
    DEFAULT_UPLOAD_FOLDER, DatasetId, Fileset, FilesetId, ImageId, Listing, OriginalFile,
    OriginalFileId, ProjectId,
};
use crate::repository::{ChunkStream, Repository, RepositoryError};

#[derive(Debug)]
pub struct MemoryRepository {
    projects: Vec<Listing<ProjectId>>,
    datasets: HashMap<ProjectId, Vec<Listing<DatasetId>>>,
    images: HashMap<DatasetId, Vec<Listing<ImageId>>>,
    folders: HashMap<ImageId, String>,
    filesets: HashMap<ImageId, FilesetId>,
    files: HashMap<FilesetId, Vec<OriginalFile>>,
    contents: HashMap<OriginalFileId, Vec<u8>>,
    chunk_size: usize,
    next_file_id: i64,
    opened: Mutex<Vec<OriginalFileId>>,
    fileset_lookups: Mutex<usize>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            projects: Vec::new(),
            datasets: HashMap::new(),
            images: HashMap::new(),
            folders: HashMap::new(),
            filesets: HashMap::new(),
            files: HashMap::new(),
            contents: HashMap::new(),
            chunk_size: 4,
            next_file_id: 1000,
            opened: Mutex::new(Vec::new()),
            fileset_lookups: Mutex::new(0),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn add_project(&mut self, id: i64, name: &str) -> &mut Self {
        self.projects.push(Listing::new(ProjectId(id), name));
        self.datasets.entry(ProjectId(id)).or_default();
        self
    }

    pub fn add_dataset(&mut self, project: i64, id: i64, name: &str) -> &mut Self {
        self.datasets
            .entry(ProjectId(project))
            .or_default()
            .push(Listing::new(DatasetId(id), name));
        self.images.entry(DatasetId(id)).or_default();
        self
    }

    pub fn add_image(&mut self, dataset: i64, id: i64, name: &str) -> &mut Self {
        self.images
            .entry(DatasetId(dataset))
            .or_default()
            .push(Listing::new(ImageId(id), name));
        self
    }

    pub fn set_upload_folder(&mut self, image: i64, folder: &str) -> &mut Self {
        self.folders.insert(ImageId(image), folder.to_string());
        self
    }

    /// Links `image` to `fileset`; several images may share one fileset.
    pub fn link_fileset(&mut self, image: i64, fileset: i64) -> &mut Self {
        self.filesets.insert(ImageId(image), FilesetId(fileset));
        self.files.entry(FilesetId(fileset)).or_default();
        self
    }

    pub fn add_file(&mut self, fileset: i64, name: &str, content: &[u8]) -> &mut Self {
        let id = OriginalFileId(self.next_file_id);
        self.next_file_id += 1;
        self.files
            .entry(FilesetId(fileset))
            .or_default()
            .push(OriginalFile {
                id,
                name: name.to_string(),
                size: content.len() as u64,
            });
        self.contents.insert(id, content.to_vec());
        self
    }

    /// Original files opened so far, in order.
    pub fn opened_files(&self) -> Vec<OriginalFileId> {
        self.opened.lock().map(|opened| opened.clone()).unwrap_or_default()
    }

    pub fn fileset_lookups(&self) -> usize {
        self.fileset_lookups.lock().map(|count| *count).unwrap_or(0)
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_projects(&self) -> Result<Vec<Listing<ProjectId>>, RepositoryError> {
        Ok(self.projects.clone())
    }

    async fn list_datasets(
        &self,
        project: ProjectId,
    ) -> Result<Vec<Listing<DatasetId>>, RepositoryError> {
        self.datasets
            .get(&project)
            .cloned()
            .ok_or(RepositoryError::NotFound {
                entity: "Project",
                id: project.get(),
            })
    }

    async fn list_images(
        &self,
        dataset: DatasetId,
    ) -> Result<Vec<Listing<ImageId>>, RepositoryError> {
        self.images
            .get(&dataset)
            .cloned()
            .ok_or(RepositoryError::NotFound {
                entity: "Dataset",
                id: dataset.get(),
            })
    }

    async fn upload_folder_of(&self, image: ImageId) -> Result<String, RepositoryError> {
        Ok(self
            .folders
            .get(&image)
            .cloned()
            .unwrap_or_else(|| DEFAULT_UPLOAD_FOLDER.to_string()))
    }

    async fn fileset_of(&self, image: ImageId) -> Result<Option<Fileset>, RepositoryError> {
        if let Ok(mut count) = self.fileset_lookups.lock() {
            *count += 1;
        }
        Ok(self.filesets.get(&image).map(|id| Fileset {
            id: *id,
            files: self.files.get(id).cloned().unwrap_or_default(),
        }))
    }

    async fn open_file(&self, file: &OriginalFile) -> Result<ChunkStream, RepositoryError> {
        let content = self
            .contents
            .get(&file.id)
            .cloned()
            .ok_or(RepositoryError::NotFound {
                entity: "OriginalFile",
                id: file.id.get(),
            })?;
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(file.id);
        }
        let chunks: Vec<Result<Bytes, RepositoryError>> = content
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}
