//! Workflows: match criteria deciding which transcode targets an item gets.

mod matcher;
mod types;

pub use matcher::{evaluate, matching_targets, workflow_matches};
pub use types::{
    Criterion, FfmpegOptions, MatchField, MatchOperator, Target, ValidationError, Workflow,
};

use std::sync::Mutex;

use uuid::Uuid;

use crate::queue::Item;

/// In-memory registry of workflows and targets consulted at the
/// persist-to-transcode transition. Mutations validate before applying.
pub struct WorkflowSet {
    inner: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    workflows: Vec<Workflow>,
    targets: Vec<Target>,
}

impl Default for WorkflowSet {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
        }
    }

    /// Seed from persisted workflows/targets, validating each workflow.
    pub fn load(workflows: Vec<Workflow>, targets: Vec<Target>) -> Result<Self, ValidationError> {
        for workflow in &workflows {
            workflow.validate()?;
        }
        Ok(Self {
            inner: Mutex::new(Registry { workflows, targets }),
        })
    }

    pub fn workflows(&self) -> Vec<Workflow> {
        self.inner.lock().unwrap().workflows.clone()
    }

    pub fn targets(&self) -> Vec<Target> {
        self.inner.lock().unwrap().targets.clone()
    }

    pub fn target(&self, id: Uuid) -> Option<Target> {
        self.inner
            .lock()
            .unwrap()
            .targets
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// Insert a target; labels are unique.
    pub fn insert_target(&self, target: Target) -> Result<(), ValidationError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.targets.iter().any(|t| t.label == target.label) {
            return Err(ValidationError::DuplicateLabel(target.label));
        }
        inner.targets.push(target);
        Ok(())
    }

    /// Insert a workflow after validating its criteria and target ids.
    pub fn insert_workflow(&self, workflow: Workflow) -> Result<(), ValidationError> {
        workflow.validate()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.workflows.iter().any(|w| w.label == workflow.label) {
            return Err(ValidationError::DuplicateLabel(workflow.label));
        }
        for target_id in &workflow.target_ids {
            if !inner.targets.iter().any(|t| t.id == *target_id) {
                return Err(ValidationError::UnknownTarget(*target_id));
            }
        }
        inner.workflows.push(workflow);
        Ok(())
    }

    pub fn remove_workflow(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.workflows.len();
        inner.workflows.retain(|w| w.id != id);
        inner.workflows.len() != before
    }

    /// Targets the item should be encoded with: the union over all enabled,
    /// matching workflows.
    pub fn targets_for(&self, item: &Item) -> Vec<Target> {
        let inner = self.inner.lock().unwrap();
        matching_targets(&inner.workflows, &inner.targets, item)
            .into_iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_target_label_rejected() {
        let set = WorkflowSet::new();
        set.insert_target(Target::new("hevc", FfmpegOptions::remux("mkv")))
            .unwrap();
        let err = set
            .insert_target(Target::new("hevc", FfmpegOptions::remux("mp4")))
            .unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateLabel(_)));
    }

    #[test]
    fn test_workflow_with_unknown_target_rejected() {
        let set = WorkflowSet::new();
        let workflow = Workflow::new("w", vec![], vec![Uuid::new_v4()]);
        assert!(matches!(
            set.insert_workflow(workflow),
            Err(ValidationError::UnknownTarget(_))
        ));
    }

    #[test]
    fn test_malformed_criterion_rejected_at_save() {
        let set = WorkflowSet::new();
        let target = Target::new("t", FfmpegOptions::remux("mkv"));
        let target_id = target.id;
        set.insert_target(target).unwrap();

        // Bypass Criterion::new to simulate a deserialized bad criterion.
        let bad = Criterion {
            field: MatchField::Season,
            op: MatchOperator::Equals,
            value: "two".into(),
        };
        let workflow = Workflow::new("w", vec![bad], vec![target_id]);
        assert!(set.insert_workflow(workflow).is_err());
    }

    #[test]
    fn test_remove_workflow() {
        let set = WorkflowSet::new();
        let workflow = Workflow::new("w", vec![], vec![]);
        let id = workflow.id;
        set.insert_workflow(workflow).unwrap();
        assert!(set.remove_workflow(id));
        assert!(!set.remove_workflow(id));
    }
}
