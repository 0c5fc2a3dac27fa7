//! Results-container handle.

use std::sync::Arc;

use crate::error::RemoteError;
use crate::remote::RemoteService;

/// A named results-container on the remote service (a Galaxy history).
///
/// Cheap to clone; many runs may share one store concurrently.
#[derive(Clone)]
pub struct Datastore {
    name: String,
    id: String,
    service: Arc<dyn RemoteService>,
}

impl Datastore {
    /// Wrap an already-resolved store.
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        service: Arc<dyn RemoteService>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            service,
        }
    }

    /// Resolve a store by name, creating it on the remote side if needed.
    pub async fn open(
        service: Arc<dyn RemoteService>,
        name: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let name = name.into();
        let id = service.get_or_create_store(&name).await?;
        tracing::debug!(store = %name, store_id = %id, "Opened data store");
        Ok(Self { name, id, service })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &Arc<dyn RemoteService> {
        &self.service
    }
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
