//! Outputs of a completed run.

use indexmap::IndexMap;

use crate::data::dataset::{Data, Dataset, DatasetCollection};
use crate::data::store::Datastore;
use crate::remote::RemoteStatus;

/// Produced outputs keyed by their declared output name, in report order.
#[derive(Debug, Clone, Default)]
pub struct Outputs {
    entries: IndexMap<String, Data>,
}

impl Outputs {
    /// Build outputs from a terminal status payload, binding every entry to `store`.
    pub(crate) fn from_status(status: &RemoteStatus, store: &Datastore) -> Self {
        let mut entries = IndexMap::new();
        for entry in &status.outputs {
            let d = Dataset::remote(&entry.name, &entry.id, store.clone());
            entries.insert(entry.name.clone(), Data::Dataset(d));
        }
        for entry in &status.output_collections {
            let dc = DatasetCollection::remote(&entry.name, &entry.id, store.clone());
            entries.insert(entry.name.clone(), Data::Collection(dc));
        }
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&Data> {
        self.entries.get(name)
    }

    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        match self.entries.get(name)? {
            Data::Dataset(d) => Some(d),
            Data::Collection(_) => None,
        }
    }

    pub fn collection(&self, name: &str) -> Option<&DatasetCollection> {
        match self.entries.get(name)? {
            Data::Collection(c) => Some(c),
            Data::Dataset(_) => None,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Data)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::remote::OutputEntry;
    use crate::remote::mock::MockService;

    fn entry(name: &str, id: &str) -> OutputEntry {
        OutputEntry {
            name: name.into(),
            id: id.into(),
        }
    }

    #[test]
    fn builds_datasets_and_collections_in_order() {
        let store = Datastore::new("s", "h1", Arc::new(MockService::new()));
        let status = RemoteStatus {
            state: "ok".into(),
            outputs: vec![entry("output1", "d1"), entry("log", "d2")],
            output_collections: vec![entry("images", "c1")],
        };
        let outputs = Outputs::from_status(&status, &store);

        assert_eq!(outputs.len(), 3);
        assert_eq!(
            outputs.names().collect::<Vec<_>>(),
            vec!["output1", "log", "images"]
        );
        assert_eq!(outputs.dataset("output1").unwrap().id(), Some("d1"));
        assert_eq!(outputs.collection("images").unwrap().id(), Some("c1"));
        assert!(outputs.dataset("images").is_none());
        assert_eq!(
            outputs.dataset("log").unwrap().store().unwrap().id(),
            "h1"
        );
    }

    #[test]
    fn empty_status_gives_empty_outputs() {
        let store = Datastore::new("s", "h1", Arc::new(MockService::new()));
        let outputs = Outputs::from_status(&RemoteStatus::new("ok"), &store);
        assert!(outputs.is_empty());
    }
}
