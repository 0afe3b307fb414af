mod client;
#[cfg(feature = "test-utils")]
mod memory;
mod model;
mod repository;

pub use client::{ListMeta, ObjectList, OmeroClient, RemoteObject};
#[cfg(feature = "test-utils")]
pub use memory::MemoryRepository;
pub use model::{
    DEFAULT_UPLOAD_FOLDER, DatasetId, Fileset, FilesetId, ImageId, Listing, OriginalFile,
    OriginalFileId, ProjectId, is_default_upload_folder,
};
pub use repository::{ApiErrorClass, ChunkStream, Repository, RepositoryError};
