use crate::core::Error;
use crate::core::ingestion::{VolumeReader, VolumeShape};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One patient: a volume file per configured modality and the class label.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub patient: String,
    pub files: Vec<PathBuf>,
    pub label: usize,
}

/// A decoded sample, one channel-last voxel buffer per modality.
#[derive(Debug, Clone)]
pub struct VolumeItem {
    pub patient: String,
    pub volumes: Vec<Vec<f32>>,
    pub label: usize,
}

/// What to do when a partition has fewer undrawn samples left than the per-class slice.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TailPolicy {
    /// Reshuffle and complete the slice from the new order.
    #[default]
    Wrap,
    /// Return the short slice; the reshuffle happens on the next draw.
    Short,
}

#[derive(Debug)]
struct ClassPartition {
    samples: Vec<Sample>,
    cursor: usize,
    exhaustions: usize,
}

impl ClassPartition {
    fn reshuffle(&mut self, rng: &mut StdRng) {
        self.samples.shuffle(rng);
        self.cursor = 0;
    }

    fn draw(&mut self, count: usize, policy: TailPolicy, rng: &mut StdRng) -> Vec<Sample> {
        let mut drawn = Vec::with_capacity(count);

        while drawn.len() < count {
            if self.cursor >= self.samples.len() {
                if policy == TailPolicy::Short && !drawn.is_empty() {
                    break;
                }
                self.reshuffle(rng);
                self.exhaustions += 1;
            }
            drawn.push(self.samples[self.cursor].clone());
            self.cursor += 1;

            if policy == TailPolicy::Short && self.cursor == self.samples.len() {
                break;
            }
        }

        drawn
    }
}

/// Class-balanced, epoch-aligned iterator over per-class sample partitions.
///
/// Every batch takes `batch_size / classes` samples from each partition. A partition is
/// drawn without replacement until exhausted, then reshuffled and restarted, so the
/// largest partition is covered exactly once per epoch while smaller ones cycle.
pub struct VolumeDataset {
    name: String,
    partitions: Vec<ClassPartition>,
    shape: VolumeShape,
    per_class: usize,
    tail_policy: TailPolicy,
    reader: Box<dyn VolumeReader>,
    rng: StdRng,
}

impl VolumeDataset {
    pub fn new(
        name: impl Into<String>,
        partitions: Vec<Vec<Sample>>,
        shape: VolumeShape,
        batch_size: usize,
        tail_policy: TailPolicy,
        reader: Box<dyn VolumeReader>,
        seed: u64,
    ) -> Result<Self, Error> {
        let name = name.into();
        let classes = partitions.len();

        if classes == 0 {
            return Err(Error::Dataset(format!("{name}: no class partitions")));
        }
        if batch_size == 0 || batch_size % classes != 0 {
            return Err(Error::Dataset(format!(
                "{name}: batch_size {batch_size} is not a positive multiple of {classes} classes"
            )));
        }
        if let Some(class) = partitions.iter().position(|p| p.is_empty()) {
            return Err(Error::Dataset(format!("{name}: class {class} has no samples")));
        }

        let mut dataset = Self {
            name,
            partitions: partitions
                .into_iter()
                .map(|samples| ClassPartition {
                    samples,
                    cursor: 0,
                    exhaustions: 0,
                })
                .collect(),
            shape,
            per_class: batch_size / classes,
            tail_policy,
            reader,
            rng: StdRng::seed_from_u64(seed),
        };
        dataset.rewind();

        tracing::debug!(
            dataset = %dataset.name,
            class_sizes = ?dataset.class_sizes(),
            num_steps = dataset.num_steps(),
            "Dataset ready"
        );

        Ok(dataset)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classes(&self) -> usize {
        self.partitions.len()
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    pub fn per_class_batch(&self) -> usize {
        self.per_class
    }

    /// Total number of samples across all partitions.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.samples.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn class_sizes(&self) -> Vec<usize> {
        self.partitions.iter().map(|p| p.samples.len()).collect()
    }

    /// Per-class sample lists in their current order.
    pub fn files(&self) -> Vec<&[Sample]> {
        self.partitions.iter().map(|p| p.samples.as_slice()).collect()
    }

    /// Batches per epoch: enough to cover the largest partition once.
    pub fn num_steps(&self) -> usize {
        let largest = self
            .partitions
            .iter()
            .map(|p| p.samples.len())
            .max()
            .unwrap_or(0);
        largest.div_ceil(self.per_class)
    }

    pub fn cursor(&self, class: usize) -> Option<usize> {
        self.partitions.get(class).map(|p| p.cursor)
    }

    /// How many times the partition of `class` ran out and was reshuffled.
    pub fn exhaustions(&self, class: usize) -> Option<usize> {
        self.partitions.get(class).map(|p| p.exhaustions)
    }

    pub fn set_cursor(&mut self, class: usize, index: usize) -> Result<(), Error> {
        let name = &self.name;
        let partition = self
            .partitions
            .get_mut(class)
            .ok_or_else(|| Error::Dataset(format!("{name}: no class {class}")))?;

        if index > partition.samples.len() {
            return Err(Error::Dataset(format!(
                "{name}: cursor {index} is past the end of class {class} ({} samples)",
                partition.samples.len()
            )));
        }
        partition.cursor = index;
        Ok(())
    }

    /// Reshuffles the undrawn remainder of every partition. Cursors stay where they are, so the
    /// current pass still draws each sample once.
    pub fn shuffle(&mut self) {
        for partition in &mut self.partitions {
            let cursor = partition.cursor.min(partition.samples.len());
            partition.samples[cursor..].shuffle(&mut self.rng);
        }
    }

    /// Resets every cursor to the start and reshuffles every partition.
    pub fn rewind(&mut self) {
        for partition in &mut self.partitions {
            partition.reshuffle(&mut self.rng);
        }
    }

    /// Draws the next class-balanced selection of samples without reading any volume.
    pub fn next_samples(&mut self) -> Vec<Sample> {
        let mut samples = Vec::with_capacity(self.per_class * self.partitions.len());
        for partition in &mut self.partitions {
            samples.extend(partition.draw(self.per_class, self.tail_policy, &mut self.rng));
        }
        samples
    }

    /// Draws the next batch and decodes its volumes, one per modality.
    pub fn next_batch(&mut self) -> Result<Vec<VolumeItem>, Error> {
        let samples = self.next_samples();

        samples
            .into_iter()
            .map(|sample| {
                let volumes = sample
                    .files
                    .iter()
                    .map(|file| self.reader.read(file, &self.shape))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(VolumeItem {
                    patient: sample.patient,
                    volumes,
                    label: sample.label,
                })
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::ingestion;
    use std::collections::HashMap;
    use std::path::Path;

    /// Fills every voxel with the label encoded in the file name (`<patient>_<label>`).
    pub(crate) struct LabelReader;

    impl VolumeReader for LabelReader {
        fn read(&self, path: &Path, shape: &VolumeShape) -> Result<Vec<f32>, ingestion::Error> {
            let value = path
                .to_str()
                .and_then(|p| p.rsplit('_').next())
                .and_then(|l| l.parse::<f32>().ok())
                .unwrap_or(0.0);
            Ok(vec![value; shape.len()])
        }
    }

    pub(crate) fn partitions(sizes: &[usize], modalities: usize) -> Vec<Vec<Sample>> {
        sizes
            .iter()
            .enumerate()
            .map(|(label, &size)| {
                (0..size)
                    .map(|i| {
                        let patient = format!("P{label}{i:03}");
                        Sample {
                            files: (0..modalities)
                                .map(|m| PathBuf::from(format!("m{m}/{patient}_{label}")))
                                .collect(),
                            patient,
                            label,
                        }
                    })
                    .collect()
            })
            .collect()
    }

    fn dataset(sizes: &[usize], batch_size: usize, policy: TailPolicy) -> VolumeDataset {
        VolumeDataset::new(
            "train",
            partitions(sizes, 1),
            VolumeShape::new(2, 2, 2, 1),
            batch_size,
            policy,
            Box::new(LabelReader),
            7,
        )
        .unwrap()
    }

    #[test]
    fn test_num_steps_covers_largest_partition() {
        assert_eq!(dataset(&[6, 2], 4, TailPolicy::Wrap).num_steps(), 3);
        assert_eq!(dataset(&[5, 5], 4, TailPolicy::Wrap).num_steps(), 3);
        assert_eq!(dataset(&[3, 9], 2, TailPolicy::Wrap).num_steps(), 9);
    }

    #[test]
    fn test_batches_are_class_balanced() {
        let mut ds = dataset(&[6, 2], 4, TailPolicy::Wrap);

        for _ in 0..ds.num_steps() {
            let batch = ds.next_batch().unwrap();
            assert_eq!(batch.len(), 4);
            assert_eq!(batch.iter().filter(|i| i.label == 0).count(), 2);
            assert_eq!(batch.iter().filter(|i| i.label == 1).count(), 2);
            for item in &batch {
                assert!(item.volumes[0].iter().all(|v| *v == item.label as f32));
            }
        }
    }

    #[test]
    fn test_three_uneven_classes_are_balanced() {
        let mut ds = dataset(&[7, 3, 5], 6, TailPolicy::Wrap);
        let mut seen: HashMap<String, usize> = HashMap::new();

        // ceil(7 / 2)
        assert_eq!(ds.num_steps(), 4);

        for _ in 0..ds.num_steps() {
            let batch = ds.next_batch().unwrap();
            assert_eq!(batch.len(), 6);
            for class in 0..3 {
                assert_eq!(batch.iter().filter(|i| i.label == class).count(), 2);
            }
            for item in batch {
                assert!(item.volumes[0].iter().all(|v| *v == item.label as f32));
                *seen.entry(item.patient).or_default() += 1;
            }
        }

        assert_eq!(seen.len(), 15);
        assert_eq!(seen.values().sum::<usize>(), 24);
        for i in 0..7 {
            assert!(seen[&format!("P0{i:03}")] <= 2);
        }
    }

    #[test]
    fn test_epoch_covers_largest_class_once_and_cycles_smaller() {
        let mut ds = dataset(&[6, 2], 4, TailPolicy::Wrap);
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..ds.num_steps() {
            for sample in ds.next_samples() {
                *counts.entry(sample.patient).or_default() += 1;
            }
        }

        for i in 0..6 {
            assert_eq!(counts[&format!("P0{i:03}")], 1);
        }
        for i in 0..2 {
            assert_eq!(counts[&format!("P1{i:03}")], 3);
        }
        assert_eq!(ds.exhaustions(0), Some(0));
        assert_eq!(ds.exhaustions(1), Some(2));
    }

    #[test]
    fn test_each_pass_draws_every_sample_once() {
        let mut ds = dataset(&[3, 3], 2, TailPolicy::Wrap);
        let mut drawn = Vec::new();

        for _ in 0..3 {
            drawn.extend(
                ds.next_samples()
                    .into_iter()
                    .filter(|s| s.label == 0)
                    .map(|s| s.patient),
            );
        }
        drawn.sort();

        assert_eq!(drawn, vec!["P0000", "P0001", "P0002"]);
        assert_eq!(ds.exhaustions(0), Some(0));

        ds.next_samples();
        assert_eq!(ds.exhaustions(0), Some(1));
    }

    #[test]
    fn test_wrap_policy_completes_short_tail() {
        let mut ds = dataset(&[5, 5], 4, TailPolicy::Wrap);
        let sizes: Vec<usize> = (0..ds.num_steps()).map(|_| ds.next_samples().len()).collect();

        assert_eq!(sizes, vec![4, 4, 4]);
        assert_eq!(ds.exhaustions(0), Some(1));
    }

    #[test]
    fn test_short_policy_returns_tail_then_reshuffles() {
        let mut ds = dataset(&[5, 5], 4, TailPolicy::Short);
        let sizes: Vec<usize> = (0..ds.num_steps()).map(|_| ds.next_samples().len()).collect();

        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(ds.exhaustions(0), Some(0));

        assert_eq!(ds.next_samples().len(), 4);
        assert_eq!(ds.exhaustions(0), Some(1));
    }

    #[test]
    fn test_rewind_resets_cursors() {
        let mut ds = dataset(&[4, 4], 4, TailPolicy::Wrap);
        ds.next_samples();
        assert_eq!(ds.cursor(0), Some(2));

        ds.rewind();

        assert_eq!(ds.cursor(0), Some(0));
        assert_eq!(ds.cursor(1), Some(0));
        assert_eq!(ds.exhaustions(0), Some(0));
    }

    #[test]
    fn test_shuffle_keeps_drawn_prefix() {
        let mut ds = dataset(&[6, 6], 4, TailPolicy::Wrap);
        let first: Vec<String> = ds.next_samples().into_iter().map(|s| s.patient).collect();

        ds.shuffle();

        let mut rest: Vec<String> = (0..2)
            .flat_map(|_| ds.next_samples())
            .map(|s| s.patient)
            .collect();
        rest.extend(first);
        rest.sort();
        rest.dedup();
        assert_eq!(rest.len(), 12);
    }

    #[test]
    fn test_set_cursor() {
        let mut ds = dataset(&[4, 4], 2, TailPolicy::Wrap);

        ds.set_cursor(1, 3).unwrap();
        assert_eq!(ds.cursor(1), Some(3));
        assert!(ds.set_cursor(1, 5).is_err());
        assert!(ds.set_cursor(2, 0).is_err());
    }

    #[test]
    fn test_files_exposes_class_sizes() {
        let ds = dataset(&[6, 2], 4, TailPolicy::Wrap);

        assert_eq!(ds.class_sizes(), vec![6, 2]);
        assert_eq!(ds.files()[1].len(), 2);
        assert_eq!(ds.len(), 8);
    }

    #[test]
    fn test_invalid_construction() {
        let shape = VolumeShape::new(1, 1, 1, 1);
        let empty_class = VolumeDataset::new(
            "train",
            partitions(&[3, 0], 1),
            shape,
            2,
            TailPolicy::Wrap,
            Box::new(LabelReader),
            0,
        );
        assert!(matches!(empty_class, Err(Error::Dataset(_))));

        let indivisible = VolumeDataset::new(
            "train",
            partitions(&[3, 3], 1),
            shape,
            3,
            TailPolicy::Wrap,
            Box::new(LabelReader),
            0,
        );
        assert!(matches!(indivisible, Err(Error::Dataset(_))));
    }
}
