use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use reqwest::StatusCode;
use thiserror::Error;

use crate::model::{DatasetId, Fileset, ImageId, Listing, OriginalFile, ProjectId};

/// Lazily produced byte chunks of one original file.
pub type ChunkStream = BoxStream<'static, Result<Bytes, RepositoryError>>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("{entity} with ID {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("stream interrupted: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    NotFound,
    Transient,
    Permanent,
}

impl RepositoryError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            RepositoryError::Api { status, .. } => Some(classify_api_status(*status)),
            RepositoryError::NotFound { .. } => Some(ApiErrorClass::NotFound),
            _ => None,
        }
    }

    /// Connectivity failures leave tree state untouched and may be retried
    /// by the user.
    pub fn is_connectivity(&self) -> bool {
        match self {
            RepositoryError::Request(err) => err.is_connect() || err.is_timeout(),
            RepositoryError::Stream(_) => true,
            other => matches!(other.classification(), Some(ApiErrorClass::Transient)),
        }
    }
}

pub(crate) fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Read-only view of the remote Project → Dataset → Image hierarchy.
///
/// Listings keep the server's order. `upload_folder_of` falls back to
/// [`DEFAULT_UPLOAD_FOLDER`](crate::DEFAULT_UPLOAD_FOLDER) when the image
/// carries no folder annotation, and `fileset_of` returns `None` for images
/// without a fileset (import pending, orphaned records).
#[async_trait]
pub trait Repository: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<Listing<ProjectId>>, RepositoryError>;

    async fn list_datasets(
        &self,
        project: ProjectId,
    ) -> Result<Vec<Listing<DatasetId>>, RepositoryError>;

    async fn list_images(&self, dataset: DatasetId)
    -> Result<Vec<Listing<ImageId>>, RepositoryError>;

    async fn upload_folder_of(&self, image: ImageId) -> Result<String, RepositoryError>;

    async fn fileset_of(&self, image: ImageId) -> Result<Option<Fileset>, RepositoryError>;

    async fn open_file(&self, file: &OriginalFile) -> Result<ChunkStream, RepositoryError>;
}
