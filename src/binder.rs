//! Parameter binding.
//!
//! Translates a [`Parameters`] map into the remote call's split of data
//! inputs and step/scalar values, checked against the labels a target
//! declares. Binding happens in two phases: [`ParameterBinder::plan`]
//! validates every label and collects local data that still needs an
//! upload, then [`BindingPlan::complete`] fills in the uploaded ids.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::Serialize;

use crate::error::BindingError;
use crate::params::{ParamValue, Parameters};
use crate::remote::{DataKind, Target, TargetMetadata};

/// A data input bound to a remote id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputBinding {
    #[serde(rename = "src")]
    pub kind: DataKind,
    pub id: String,
}

/// Resolved bindings for one invoke call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    /// Label → dataset or collection reference.
    pub inputs: BTreeMap<String, InputBinding>,
    /// Label → raw value.
    pub steps: BTreeMap<String, serde_json::Value>,
}

/// Local data that has to be uploaded before it can be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    Dataset { path: PathBuf },
    Collection { name: String, paths: Vec<PathBuf> },
}

impl UploadSource {
    pub fn kind(&self) -> DataKind {
        match self {
            Self::Dataset { .. } => DataKind::Dataset,
            Self::Collection { .. } => DataKind::Collection,
        }
    }
}

/// A parameter waiting for its upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub label: String,
    pub source: UploadSource,
}

/// Validated bindings with uploads still outstanding.
#[derive(Debug, Clone, Default)]
pub struct BindingPlan {
    bindings: Bindings,
    pending: Vec<PendingUpload>,
}

impl BindingPlan {
    pub fn pending(&self) -> &[PendingUpload] {
        &self.pending
    }

    /// Finish binding with the ids produced by the uploads, keyed by label.
    pub fn complete(self, uploaded: &HashMap<String, String>) -> Result<Bindings, BindingError> {
        let mut bindings = self.bindings;
        for pending in self.pending {
            let id = uploaded
                .get(&pending.label)
                .cloned()
                .ok_or_else(|| BindingError::UploadMissing {
                    label: pending.label.clone(),
                })?;
            bindings.inputs.insert(
                pending.label,
                InputBinding {
                    kind: pending.source.kind(),
                    id,
                },
            );
        }
        Ok(bindings)
    }
}

/// Binds parameters against one target's declared labels.
pub struct ParameterBinder<'a> {
    target: &'a Target,
    metadata: &'a TargetMetadata,
}

impl<'a> ParameterBinder<'a> {
    pub fn new(target: &'a Target, metadata: &'a TargetMetadata) -> Self {
        Self { target, metadata }
    }

    /// Validate every parameter and split it into bindings and pending uploads.
    pub fn plan(&self, params: &Parameters) -> Result<BindingPlan, BindingError> {
        let mut plan = BindingPlan::default();

        for (label, value) in params.iter() {
            match value {
                ParamValue::Dataset(d) => {
                    self.require_input(label)?;
                    match (d.id(), d.path()) {
                        (Some(id), _) => self.bind_input(&mut plan, label, DataKind::Dataset, id),
                        (None, Some(path)) => plan.pending.push(PendingUpload {
                            label: label.to_string(),
                            source: UploadSource::Dataset {
                                path: path.to_path_buf(),
                            },
                        }),
                        (None, None) => return Err(self.missing_id("Dataset", label)),
                    }
                }
                ParamValue::Collection(c) => {
                    self.require_input(label)?;
                    match c.id() {
                        Some(id) => self.bind_input(&mut plan, label, DataKind::Collection, id),
                        None if !c.paths().is_empty() => plan.pending.push(PendingUpload {
                            label: label.to_string(),
                            source: UploadSource::Collection {
                                name: c.name().to_string(),
                                paths: c.paths().to_vec(),
                            },
                        }),
                        None => return Err(self.missing_id("DatasetCollection", label)),
                    }
                }
                ParamValue::Scalar(s) => {
                    if !self.is_input(label) && !self.is_step(label) {
                        let mut available = self.metadata.inputs.clone();
                        available.extend(self.metadata.steps.iter().cloned());
                        return Err(self.unknown_label(label, available));
                    }
                    plan.bindings.steps.insert(label.to_string(), s.to_json());
                }
                ParamValue::Step(raw) => {
                    if !self.is_step(label) {
                        return Err(self.unknown_label(label, self.metadata.steps.clone()));
                    }
                    plan.bindings.steps.insert(label.to_string(), raw.clone());
                }
            }
        }

        Ok(plan)
    }

    /// Bind parameters whose data values all carry remote ids already.
    pub fn bind(&self, params: &Parameters) -> Result<Bindings, BindingError> {
        let plan = self.plan(params)?;
        if let Some(first) = plan.pending.first() {
            let kind = match first.source {
                UploadSource::Dataset { .. } => "Dataset",
                UploadSource::Collection { .. } => "DatasetCollection",
            };
            return Err(self.missing_id(kind, &first.label));
        }
        Ok(plan.bindings)
    }

    fn is_input(&self, label: &str) -> bool {
        self.metadata.inputs.iter().any(|l| l == label)
    }

    fn is_step(&self, label: &str) -> bool {
        self.metadata.steps.iter().any(|l| l == label)
    }

    fn require_input(&self, label: &str) -> Result<(), BindingError> {
        if self.is_input(label) {
            Ok(())
        } else {
            Err(self.unknown_label(label, self.metadata.inputs.clone()))
        }
    }

    fn bind_input(&self, plan: &mut BindingPlan, label: &str, kind: DataKind, id: &str) {
        plan.bindings.inputs.insert(
            label.to_string(),
            InputBinding {
                kind,
                id: id.to_string(),
            },
        );
    }

    fn unknown_label(&self, label: &str, available: Vec<String>) -> BindingError {
        BindingError::UnknownLabel {
            label: label.to_string(),
            target: self.target.to_string(),
            available,
        }
    }

    fn missing_id(&self, kind: &'static str, label: &str) -> BindingError {
        BindingError::MissingId {
            kind,
            label: label.to_string(),
            target: self.target.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::data::{Dataset, DatasetCollection, Datastore};
    use crate::remote::mock::MockService;

    fn metadata() -> TargetMetadata {
        TargetMetadata {
            inputs: vec!["Manifest File".into(), "Image files".into(), "a".into()],
            steps: vec!["Reduce".into()],
        }
    }

    fn store() -> Datastore {
        Datastore::new("s", "h1", Arc::new(MockService::new()))
    }

    #[test]
    fn scalar_goes_to_steps() {
        let target = Target::tool("t");
        let meta = TargetMetadata {
            inputs: vec!["mode".into()],
            steps: vec![],
        };
        let params = Parameters::new().with_input("mode", "fast");
        let b = ParameterBinder::new(&target, &meta).bind(&params).unwrap();
        assert!(b.inputs.is_empty());
        assert_eq!(b.steps.get("mode"), Some(&serde_json::json!("fast")));
    }

    #[test]
    fn remote_data_binds_by_kind() {
        let target = Target::workflow("wf");
        let meta = metadata();
        let params = Parameters::new()
            .with_input("Manifest File", Dataset::remote("m", "d1", store()))
            .with_input("Image files", DatasetCollection::remote("i", "c1", store()));
        let b = ParameterBinder::new(&target, &meta).bind(&params).unwrap();
        assert_eq!(
            b.inputs["Manifest File"],
            InputBinding {
                kind: DataKind::Dataset,
                id: "d1".into()
            }
        );
        assert_eq!(b.inputs["Image files"].kind, DataKind::Collection);
    }

    #[test]
    fn step_value_requires_step_label() {
        let target = Target::workflow("wf");
        let meta = metadata();
        let mut params = Parameters::new();
        params.add_step_value("Reduce", serde_json::json!({"n": 1}));
        let b = ParameterBinder::new(&target, &meta).bind(&params).unwrap();
        assert_eq!(b.steps["Reduce"], serde_json::json!({"n": 1}));

        let mut params = Parameters::new();
        params.add_step_value("a", serde_json::json!(1));
        let err = ParameterBinder::new(&target, &meta).bind(&params).unwrap_err();
        assert!(matches!(
            err,
            BindingError::UnknownLabel { available, .. } if available == vec!["Reduce".to_string()]
        ));
    }

    #[test]
    fn unknown_label_lists_available() {
        let target = Target::workflow("wf");
        let meta = metadata();
        let params = Parameters::new().with_input("bogus", 1);
        let err = ParameterBinder::new(&target, &meta).plan(&params).unwrap_err();
        match err {
            BindingError::UnknownLabel {
                label,
                target,
                available,
            } => {
                assert_eq!(label, "bogus");
                assert_eq!(target, "workflow wf");
                assert_eq!(available.len(), 4);
                assert!(available.contains(&"Reduce".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn dataset_without_id_or_path_fails() {
        let target = Target::workflow("wf");
        let meta = metadata();
        let params = Parameters::new().with_input(
            "Image files",
            DatasetCollection::new("i", Vec::<PathBuf>::new()),
        );
        let err = ParameterBinder::new(&target, &meta).plan(&params).unwrap_err();
        assert!(matches!(err, BindingError::MissingId { label, .. } if label == "Image files"));
    }

    #[test]
    fn local_data_is_planned_for_upload() {
        let target = Target::workflow("wf");
        let meta = metadata();
        let params = Parameters::new()
            .with_input("Manifest File", Dataset::new("data/manifest.csv"))
            .with_input("a", 18.39);
        let binder = ParameterBinder::new(&target, &meta);
        let plan = binder.plan(&params).unwrap();
        assert_eq!(plan.pending().len(), 1);
        assert_eq!(plan.pending()[0].label, "Manifest File");

        assert!(matches!(
            binder.bind(&params).unwrap_err(),
            BindingError::MissingId { kind: "Dataset", .. }
        ));

        let uploaded = HashMap::from([("Manifest File".to_string(), "d9".to_string())]);
        let b = plan.complete(&uploaded).unwrap();
        assert_eq!(b.inputs["Manifest File"].id, "d9");
        assert_eq!(b.steps["a"], serde_json::json!(18.39));
    }

    #[test]
    fn complete_without_upload_result_fails() {
        let target = Target::workflow("wf");
        let meta = metadata();
        let params = Parameters::new().with_input("Manifest File", Dataset::new("m.csv"));
        let plan = ParameterBinder::new(&target, &meta).plan(&params).unwrap();
        assert!(matches!(
            plan.complete(&HashMap::new()),
            Err(BindingError::UploadMissing { .. })
        ));
    }

    #[test]
    fn input_binding_serializes_as_src_id() {
        let b = InputBinding {
            kind: DataKind::Collection,
            id: "c1".into(),
        };
        assert_eq!(
            serde_json::to_value(&b).unwrap(),
            serde_json::json!({"src": "hdca", "id": "c1"})
        );
    }
}
