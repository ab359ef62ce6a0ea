use crate::core::Error;
use crate::core::checkpoint::CheckpointManifest;
use crate::core::layers::{LayerName, ParamEntry, ParamKey};
use crate::core::model::{Classifier, ClassifierConfig};
use burn::prelude::*;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Copied from the source checkpoint
    Pretrained,
    /// Freshly initialised and trainable
    Fresh,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub key: ParamKey,
    pub role: ParamRole,
}

/// Which layers of a classifier come from a checkpoint and which start fresh.
#[derive(Debug, Clone, PartialEq)]
pub struct RestorePlan {
    pub groups: Vec<ParamGroup>,
    /// Exclude restored groups from gradient updates
    pub freeze_pretrained: bool,
}

fn layer_keys(config: &ClassifierConfig) -> Vec<ParamKey> {
    let scope = config.modality.as_str();
    let mut keys: Vec<ParamKey> = (0..config.tower.branch_kernels.len())
        .map(|i| ParamKey::new(scope, LayerName::Branch(i)))
        .collect();
    keys.extend(
        (0..config.tower.stages.len()).map(|j| ParamKey::new(scope, LayerName::Conv(j + 2))),
    );
    keys.push(ParamKey::new(scope, LayerName::Hidden));
    keys.push(ParamKey::new(scope, LayerName::Logits));
    keys
}

impl RestorePlan {
    /// Every layer restored.
    pub fn full(config: &ClassifierConfig) -> Self {
        Self {
            groups: layer_keys(config)
                .into_iter()
                .map(|key| ParamGroup {
                    key,
                    role: ParamRole::Pretrained,
                })
                .collect(),
            freeze_pretrained: false,
        }
    }

    /// Tower layers restored, `fullcn` and `logits` freshly initialised.
    pub fn fine_tune(config: &ClassifierConfig, freeze_pretrained: bool) -> Self {
        Self {
            groups: layer_keys(config)
                .into_iter()
                .map(|key| {
                    let role = match key.layer {
                        LayerName::Hidden | LayerName::Logits => ParamRole::Fresh,
                        _ => ParamRole::Pretrained,
                    };
                    ParamGroup { key, role }
                })
                .collect(),
            freeze_pretrained,
        }
    }

    pub fn role(&self, key: &ParamKey) -> ParamRole {
        self.groups
            .iter()
            .find(|g| &g.key == key)
            .map(|g| g.role)
            .unwrap_or(ParamRole::Fresh)
    }

    pub fn pretrained(&self) -> impl Iterator<Item = &ParamKey> {
        self.groups
            .iter()
            .filter(|g| g.role == ParamRole::Pretrained)
            .map(|g| &g.key)
    }

    /// Checks that every pretrained parameter of `expected` is in the manifest with the same shape.
    pub fn validate(
        &self,
        expected: &[ParamEntry],
        manifest: &CheckpointManifest,
        path: &Path,
    ) -> Result<(), Error> {
        let expected: HashMap<&str, &ParamEntry> =
            expected.iter().map(|e| (e.key.as_str(), e)).collect();

        for key in self.pretrained() {
            for name in [key.weights(), key.biases()] {
                let Some(target) = expected.get(name.as_str()) else {
                    return Err(Error::MissingParameter {
                        key: name,
                        path: path.to_path_buf(),
                    });
                };
                let source = manifest.param(&name).ok_or_else(|| Error::MissingParameter {
                    key: name.clone(),
                    path: path.to_path_buf(),
                })?;
                if source.shape != target.shape {
                    return Err(Error::shape_mismatch(name, &target.shape, &source.shape));
                }
            }
        }

        Ok(())
    }

    /// Moves the pretrained layers of `source` into `target`; fresh layers keep their
    /// initialisation. Restored layers are frozen when the plan asks for it.
    pub fn apply<B: Backend>(&self, target: Classifier<B>, source: Classifier<B>) -> Classifier<B> {
        let mut restored: HashMap<ParamKey, _> = source
            .tower
            .branches
            .into_iter()
            .chain(source.tower.stages)
            .map(|layer| (layer.key().clone(), layer))
            .collect();

        let mut target = target;
        for layer in target.tower.layers_mut() {
            if self.role(layer.key()) != ParamRole::Pretrained {
                continue;
            }
            if let Some(pretrained) = restored.remove(layer.key()) {
                *layer = if self.freeze_pretrained {
                    pretrained.no_grad()
                } else {
                    pretrained
                };
            }
        }

        let mut head = target.head;
        let source_head = source.head;
        if self.role(head.hidden.key()) == ParamRole::Pretrained {
            head.hidden = self.thaw_or_freeze(source_head.hidden);
        }
        if self.role(head.logits.key()) == ParamRole::Pretrained {
            head.logits = self.thaw_or_freeze(source_head.logits);
        }
        target.head = head;

        tracing::info!(
            restored = self.pretrained().count(),
            fresh = self.groups.len() - self.pretrained().count(),
            frozen = self.freeze_pretrained,
            "Parameters restored"
        );

        target
    }

    fn thaw_or_freeze<B: Backend, M: Module<B>>(&self, module: M) -> M {
        if self.freeze_pretrained {
            module.no_grad()
        } else {
            module
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checkpoint::CheckpointDir;
    use crate::core::ingestion::VolumeShape;
    use crate::core::model::VolumeClassifier;
    use crate::core::model::tests::tiny_classifier;
    use crate::core::tower::{StageConfig, TowerConfig};
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn values<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    fn saved_source(dir: &Path) -> (CheckpointDir, Classifier<TestBackend>) {
        let device = Default::default();
        let checkpoints = CheckpointDir::new(dir, None);
        let source = tiny_classifier("T1_brain").init::<TestBackend>(&device).unwrap();
        checkpoints.save(&source, 5, source.param_entries()).unwrap();
        (checkpoints, source)
    }

    #[test]
    fn test_fine_tune_plan_groups() {
        let plan = RestorePlan::fine_tune(&tiny_classifier("T1_brain"), true);
        let fresh: Vec<String> = plan
            .groups
            .iter()
            .filter(|g| g.role == ParamRole::Fresh)
            .map(|g| g.key.to_string())
            .collect();

        assert_eq!(plan.groups.len(), 6);
        assert_eq!(fresh, vec!["T1_brain/fullcn", "T1_brain/logits"]);
    }

    #[test]
    fn test_selective_restore_copies_tower_and_keeps_fresh_head() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let (checkpoints, source) = saved_source(dir.path());
        let config = tiny_classifier("T1_brain");
        let plan = RestorePlan::fine_tune(&config, true);

        let target = config.init::<TestBackend>(&device).unwrap();
        plan.validate(&target.param_entries(), &checkpoints.manifest().unwrap(), dir.path())
            .unwrap();
        let (loaded, _) = checkpoints
            .load_latest(config.init::<TestBackend>(&device).unwrap(), &device)
            .unwrap();
        let fresh_logits = values(target.head.logits.weight.val());
        let restored = plan.apply(target, loaded);

        for (got, want) in restored.tower.layers().zip(source.tower.layers()) {
            assert_eq!(values(got.weight.val()), values(want.weight.val()));
            assert_eq!(values(got.bias.val()), values(want.bias.val()));
            assert!(!got.weight.val().is_require_grad());
        }
        assert_eq!(values(restored.head.logits.weight.val()), fresh_logits);
        assert_ne!(
            values(restored.head.hidden.weight.val()),
            values(source.head.hidden.weight.val())
        );
        assert!(restored.head.hidden.weight.val().is_require_grad());
        assert!(restored.head.logits.weight.val().is_require_grad());
    }

    #[test]
    fn test_restore_without_freezing_keeps_tower_trainable() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let (checkpoints, _) = saved_source(dir.path());
        let config = tiny_classifier("T1_brain");
        let plan = RestorePlan::fine_tune(&config, false);

        let (loaded, _) = checkpoints
            .load_latest(config.init::<TestBackend>(&device).unwrap(), &device)
            .unwrap();
        let restored = plan.apply(config.init::<TestBackend>(&device).unwrap(), loaded);

        assert!(restored.tower.layers().all(|l| l.weight.val().is_require_grad()));
    }

    #[test]
    fn test_missing_pretrained_layer_is_a_loud_error() {
        let dir = TempDir::new().unwrap();
        let (checkpoints, _) = saved_source(dir.path());
        let mut deeper = TowerConfig::new(
            1,
            vec![2, 3],
            2,
            vec![StageConfig::new(3, 4), StageConfig::new(3, 6), StageConfig::new(3, 6)],
        );
        deeper.stages[2].stride = 1;
        let config = ClassifierConfig::new(
            "T1_brain".to_string(),
            VolumeShape::new(8, 8, 8, 1),
            deeper,
            5,
            2,
        );
        let plan = RestorePlan::fine_tune(&config, true);

        let result = plan.validate(
            &config.tower.param_entries("T1_brain"),
            &checkpoints.manifest().unwrap(),
            dir.path(),
        );

        assert!(matches!(
            result,
            Err(Error::MissingParameter { key, .. }) if key == "T1_brain/conv4/weights"
        ));
    }

    #[test]
    fn test_shape_mismatch_is_a_loud_error() {
        let dir = TempDir::new().unwrap();
        let (checkpoints, _) = saved_source(dir.path());
        let wider = TowerConfig::new(
            1,
            vec![2, 3],
            2,
            vec![StageConfig::new(3, 8), StageConfig::new(3, 6)],
        );
        let config = ClassifierConfig::new(
            "T1_brain".to_string(),
            VolumeShape::new(8, 8, 8, 1),
            wider,
            5,
            2,
        );
        let plan = RestorePlan::fine_tune(&config, true);

        let result = plan.validate(
            &config.tower.param_entries("T1_brain"),
            &checkpoints.manifest().unwrap(),
            dir.path(),
        );

        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }
}
