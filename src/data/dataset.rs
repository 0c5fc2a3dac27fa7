//! Datasets and dataset collections.

use std::path::{Path, PathBuf};

use crate::data::store::Datastore;
use crate::error::{Error, UsageError};
use crate::remote::DataKind;

/// A single dataset, either local (path only) or remote (id + store).
#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    path: Option<PathBuf>,
    id: Option<String>,
    store: Option<Datastore>,
}

impl Dataset {
    /// A local file to be uploaded on first use. Named after the file.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            path: Some(path),
            id: None,
            store: None,
        }
    }

    /// A dataset that already exists in `store`.
    pub fn remote(name: impl Into<String>, id: impl Into<String>, store: Datastore) -> Self {
        Self {
            name: name.into(),
            path: None,
            id: Some(id.into()),
            store: Some(store),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn store(&self) -> Option<&Datastore> {
        self.store.as_ref()
    }

    fn bind(&mut self, id: String, store: Datastore) {
        self.id = Some(id);
        self.store = Some(store);
    }

    /// Upload the local file into `store` and bind this dataset to the new id.
    pub async fn upload(&mut self, store: &Datastore) -> Result<(), Error> {
        let path = self.path.as_deref().ok_or_else(|| UsageError::NothingToUpload {
            name: self.name.clone(),
        })?;
        let id = store.service().upload_dataset(store.id(), path).await?;
        tracing::debug!(
            dataset = %self.name,
            id = %id,
            store = %store.name(),
            "Uploaded dataset"
        );
        self.bind(id, store.clone());
        Ok(())
    }

    /// Download the dataset content through its store.
    pub async fn content(&self) -> Result<Vec<u8>, Error> {
        let (id, store) = self.remote_ref()?;
        Ok(store.service().download(DataKind::Dataset, id).await?)
    }

    /// Download the dataset into a local file, replacing it if present.
    pub async fn download(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        write_local(&self.name, self.content().await?, path.as_ref()).await
    }

    fn remote_ref(&self) -> Result<(&str, &Datastore), UsageError> {
        match (self.id.as_deref(), self.store.as_ref()) {
            (Some(id), Some(store)) => Ok((id, store)),
            _ => Err(UsageError::Unbound {
                kind: "Dataset",
                name: self.name.clone(),
            }),
        }
    }
}

/// A list collection of datasets.
#[derive(Debug, Clone)]
pub struct DatasetCollection {
    name: String,
    paths: Vec<PathBuf>,
    id: Option<String>,
    store: Option<Datastore>,
}

impl DatasetCollection {
    /// Local files to be uploaded and grouped on first use.
    pub fn new(
        name: impl Into<String>,
        paths: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Self {
        Self {
            name: name.into(),
            paths: paths.into_iter().map(Into::into).collect(),
            id: None,
            store: None,
        }
    }

    /// A collection that already exists in `store`.
    pub fn remote(name: impl Into<String>, id: impl Into<String>, store: Datastore) -> Self {
        Self {
            name: name.into(),
            paths: Vec::new(),
            id: Some(id.into()),
            store: Some(store),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn store(&self) -> Option<&Datastore> {
        self.store.as_ref()
    }

    /// Upload the local files into `store` as a list collection.
    pub async fn upload(&mut self, store: &Datastore) -> Result<(), Error> {
        if self.paths.is_empty() {
            return Err(UsageError::NothingToUpload {
                name: self.name.clone(),
            }
            .into());
        }
        let id = store
            .service()
            .upload_collection(store.id(), &self.name, &self.paths)
            .await?;
        tracing::debug!(
            collection = %self.name,
            id = %id,
            files = self.paths.len(),
            "Uploaded collection"
        );
        self.id = Some(id);
        self.store = Some(store.clone());
        Ok(())
    }

    /// Download the collection (as an archive) through its store.
    pub async fn content(&self) -> Result<Vec<u8>, Error> {
        match (self.id.as_deref(), self.store.as_ref()) {
            (Some(id), Some(store)) => {
                Ok(store.service().download(DataKind::Collection, id).await?)
            }
            _ => Err(UsageError::Unbound {
                kind: "DatasetCollection",
                name: self.name.clone(),
            }
            .into()),
        }
    }

    /// Download the collection archive into a local file.
    pub async fn download(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        write_local(&self.name, self.content().await?, path.as_ref()).await
    }
}

async fn write_local(name: &str, bytes: Vec<u8>, path: &Path) -> Result<(), Error> {
    tokio::fs::write(path, &bytes).await?;
    tracing::debug!(data = %name, path = %path.display(), bytes = bytes.len(), "Downloaded");
    Ok(())
}

/// Upload several local datasets into `store` concurrently.
///
/// Every upload is issued at once; the first failure aborts the rest.
pub async fn upload_datasets(
    store: &Datastore,
    datasets: &mut [&mut Dataset],
) -> Result<(), Error> {
    futures::future::try_join_all(datasets.iter_mut().map(|d| d.upload(store))).await?;
    Ok(())
}

/// A produced output: a dataset or a collection.
#[derive(Debug, Clone)]
pub enum Data {
    Dataset(Dataset),
    Collection(DatasetCollection),
}

impl Data {
    pub fn name(&self) -> &str {
        match self {
            Self::Dataset(d) => d.name(),
            Self::Collection(c) => c.name(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Dataset(d) => d.id(),
            Self::Collection(c) => c.id(),
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            Self::Dataset(_) => DataKind::Dataset,
            Self::Collection(_) => DataKind::Collection,
        }
    }

    pub async fn content(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Dataset(d) => d.content().await,
            Self::Collection(c) => c.content().await,
        }
    }

    pub async fn download(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        match self {
            Self::Dataset(d) => d.download(path).await,
            Self::Collection(c) => c.download(path).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::remote::mock::MockService;

    #[test]
    fn local_dataset_named_after_file() {
        let d = Dataset::new("data/goniometer.csv");
        assert_eq!(d.name(), "goniometer.csv");
        assert!(d.id().is_none());
        assert_eq!(d.path(), Some(Path::new("data/goniometer.csv")));
    }

    #[tokio::test]
    async fn content_requires_remote_binding() {
        let d = Dataset::new("a.txt");
        let err = d.content().await.unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::Unbound { .. })));
    }

    #[tokio::test]
    async fn content_downloads_through_store() {
        let mock = Arc::new(MockService::new());
        mock.set_content("d1", b"hostname: node1");
        let store = Datastore::new("s", "h1", mock.clone());
        let d = Dataset::remote("output1", "d1", store);
        assert_eq!(d.content().await.unwrap(), b"hostname: node1");
    }

    #[tokio::test]
    async fn upload_binds_dataset_to_store() {
        let mock = Arc::new(MockService::new());
        let store = Datastore::new("s", "h1", mock.clone());
        let mut a = Dataset::new("data/a.csv");
        let mut b = Dataset::new("data/b.csv");
        upload_datasets(&store, &mut [&mut a, &mut b]).await.unwrap();

        assert_eq!(a.id(), Some("upload-a.csv"));
        assert_eq!(b.id(), Some("upload-b.csv"));
        assert_eq!(a.store().unwrap().id(), "h1");
        assert_eq!(mock.calls_named("upload_dataset"), 2);
    }

    #[tokio::test]
    async fn upload_without_path_is_usage_error() {
        let store = Datastore::new("s", "h1", Arc::new(MockService::new()));
        let mut c = DatasetCollection::new("empty", Vec::<PathBuf>::new());
        let err = c.upload(&store).await.unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::NothingToUpload { .. })));
    }

    #[tokio::test]
    async fn collection_content_uses_collection_kind() {
        let mock = Arc::new(MockService::new());
        mock.set_content("c1", b"zip");
        let store = Datastore::new("s", "h1", mock.clone());
        let data = Data::Collection(DatasetCollection::remote("images", "c1", store));
        assert_eq!(data.kind(), DataKind::Collection);
        assert_eq!(data.content().await.unwrap(), b"zip");
    }

    #[tokio::test]
    async fn download_writes_local_file() {
        let mock = Arc::new(MockService::new());
        mock.set_content("d1", b"hostname: node1");
        mock.set_content("c1", b"zip");
        let store = Datastore::new("s", "h1", mock.clone());
        let dir = tempfile::tempdir().unwrap();

        let output = dir.path().join("output1.txt");
        Dataset::remote("output1", "d1", store.clone())
            .download(&output)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"hostname: node1");

        let archive = dir.path().join("images.zip");
        Data::Collection(DatasetCollection::remote("images", "c1", store))
            .download(&archive)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&archive).unwrap(), b"zip");
    }

    #[tokio::test]
    async fn download_of_unbound_dataset_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        let err = Dataset::new("a.txt").download(&path).await.unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::Unbound { .. })));
        assert!(!path.exists());
    }
}
