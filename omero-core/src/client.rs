use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::{
    DEFAULT_UPLOAD_FOLDER, DatasetId, Fileset, FilesetId, ImageId, Listing, OriginalFile,
    OriginalFileId, ProjectId,
};
use crate::repository::{ChunkStream, Repository, RepositoryError};

const DEFAULT_BASE_URL: &str = "https://omero-cci-users.gu.se";
const DEFAULT_PAGE_SIZE: u32 = 200;
const FOLDER_ANNOTATION_KEY: &str = "Folder";
// Not served by stock OMERO.web: the server needs a web app exposing
// `Image.fileset` with its original files (the BlitzGateway
// `getFileset().listFiles()` view) at this route.
const FILESET_ROUTE: &str = "/api/v0/m/images/{id}/fileset/";

/// HTTP client for the OMERO.web JSON API.
///
/// Every request joins the existing server session identified by the
/// session token through the `bsession` query parameter.
#[derive(Clone)]
pub struct OmeroClient {
    http: Client,
    base_url: Url,
    session: String,
    page_size: u32,
}

impl OmeroClient {
    pub fn new(session: impl Into<String>) -> Result<Self, RepositoryError> {
        Self::with_base_url(DEFAULT_BASE_URL, session)
    }

    /// `base_url` may carry a path prefix when OMERO.web is not mounted at
    /// the server root; every route is resolved below it.
    pub fn with_base_url(base_url: &str, session: impl Into<String>) -> Result<Self, RepositoryError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let prefixed = format!("{}/", base_url.path());
            base_url.set_path(&prefixed);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            session: session.into(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn list_page(
        &self,
        path: &str,
        limit: u32,
        offset: u32,
    ) -> Result<ObjectList, RepositoryError> {
        let mut url = self.endpoint(path)?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        let response = self.http.get(url).send().await?;
        Self::handle_response(response).await
    }

    async fn list_all<I: From<i64>>(
        &self,
        path: &str,
    ) -> Result<Vec<Listing<I>>, RepositoryError> {
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self.list_page(path, self.page_size, offset).await?;
            let received = page.data.len() as u32;
            offset = offset.saturating_add(received);
            items.extend(
                page.data
                    .into_iter()
                    .map(|object| Listing::new(I::from(object.id), object.name.unwrap_or_default())),
            );
            let total = page.meta.map(|meta| meta.total_count).unwrap_or(offset);
            if received == 0 || offset >= total {
                break;
            }
        }
        Ok(items)
    }

    fn endpoint(&self, path: &str) -> Result<Url, RepositoryError> {
        let mut url = self.base_url.join(path.trim_start_matches('/'))?;
        url.query_pairs_mut().append_pair("bsession", &self.session);
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RepositoryError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RepositoryError::Api { status, body })
        }
    }
}

fn not_found_as(err: RepositoryError, entity: &'static str, id: i64) -> RepositoryError {
    match err {
        RepositoryError::Api { status, .. } if status == StatusCode::NOT_FOUND => {
            RepositoryError::NotFound { entity, id }
        }
        other => other,
    }
}

#[async_trait]
impl Repository for OmeroClient {
    async fn list_projects(&self) -> Result<Vec<Listing<ProjectId>>, RepositoryError> {
        self.list_all("/api/v0/m/projects/").await
    }

    async fn list_datasets(
        &self,
        project: ProjectId,
    ) -> Result<Vec<Listing<DatasetId>>, RepositoryError> {
        self.list_all(&format!("/api/v0/m/projects/{project}/datasets/"))
            .await
            .map_err(|err| not_found_as(err, "Project", project.get()))
    }

    async fn list_images(
        &self,
        dataset: DatasetId,
    ) -> Result<Vec<Listing<ImageId>>, RepositoryError> {
        self.list_all(&format!("/api/v0/m/datasets/{dataset}/images/"))
            .await
            .map_err(|err| not_found_as(err, "Dataset", dataset.get()))
    }

    async fn upload_folder_of(&self, image: ImageId) -> Result<String, RepositoryError> {
        let mut url = self.endpoint("/webclient/api/annotations/")?;
        url.query_pairs_mut()
            .append_pair("type", "map")
            .append_pair("image", &image.to_string());
        let response = self.http.get(url).send().await?;
        let annotations: AnnotationList = match Self::handle_response(response).await {
            Ok(list) => list,
            Err(RepositoryError::Api { status, .. }) if status == StatusCode::NOT_FOUND => {
                return Ok(DEFAULT_UPLOAD_FOLDER.to_string());
            }
            Err(err) => return Err(err),
        };
        Ok(annotations
            .folder()
            .unwrap_or_else(|| DEFAULT_UPLOAD_FOLDER.to_string()))
    }

    async fn fileset_of(&self, image: ImageId) -> Result<Option<Fileset>, RepositoryError> {
        let url = self.endpoint(&FILESET_ROUTE.replace("{id}", &image.to_string()))?;
        let response = self.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let payload: FilesetResponse = Self::handle_response(response).await?;
        Ok(payload.data.map(FilesetObject::into_fileset))
    }

    async fn open_file(&self, file: &OriginalFile) -> Result<ChunkStream, RepositoryError> {
        let url = self.endpoint(&format!("/webgateway/original_file/{}/", file.id))?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(not_found_as(
                RepositoryError::Api { status, body },
                "OriginalFile",
                file.id.get(),
            ));
        }
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| RepositoryError::Stream(err.to_string())))
            .boxed())
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ObjectList {
    #[serde(default)]
    pub meta: Option<ListMeta>,
    #[serde(default)]
    pub data: Vec<RemoteObject>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListMeta {
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(rename = "totalCount")]
    pub total_count: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RemoteObject {
    #[serde(rename = "@id")]
    pub id: i64,
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnnotationList {
    #[serde(default)]
    annotations: Vec<MapAnnotation>,
}

#[derive(Debug, Deserialize)]
struct MapAnnotation {
    #[serde(default)]
    values: Vec<(String, String)>,
}

impl AnnotationList {
    fn folder(&self) -> Option<String> {
        self.annotations
            .iter()
            .flat_map(|annotation| annotation.values.iter())
            .find(|(key, _)| key == FOLDER_ANNOTATION_KEY)
            .map(|(_, value)| value.clone())
    }
}

#[derive(Debug, Deserialize)]
struct FilesetResponse {
    #[serde(default)]
    data: Option<FilesetObject>,
}

#[derive(Debug, Deserialize)]
struct FilesetObject {
    #[serde(rename = "@id")]
    id: i64,
    #[serde(default)]
    files: Vec<FileObject>,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    #[serde(rename = "@id")]
    id: i64,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Size", default)]
    size: u64,
}

impl FilesetObject {
    fn into_fileset(self) -> Fileset {
        Fileset {
            id: FilesetId(self.id),
            files: self
                .files
                .into_iter()
                .map(|file| OriginalFile {
                    id: OriginalFileId(file.id),
                    name: file.name,
                    size: file.size,
                })
                .collect(),
        }
    }
}
