use super::dataset::VolumeItem;
use crate::core::ingestion::VolumeShape;
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

/// A batch of decoded volumes, ready for the model.
#[derive(Clone, Debug)]
pub struct VolumeBatch<B: Backend> {
    pub patients: Vec<String>,
    /// One tensor per modality: shape [batch_size, channels, depth, height, width]
    pub volumes: Vec<Tensor<B, 5>>,
    /// Class indices: shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
    pub labels: Vec<usize>,
}

impl<B: Backend> VolumeBatch<B> {
    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct VolumeBatcher<B: Backend> {
    shape: VolumeShape,
    _phantom: core::marker::PhantomData<B>,
}

impl<B: Backend> VolumeBatcher<B> {
    pub fn new(shape: VolumeShape) -> Self {
        Self {
            shape,
            _phantom: core::marker::PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, VolumeItem, VolumeBatch<B>> for VolumeBatcher<B> {
    /// Stacks channel-last voxel buffers and moves the channel axis to position 1.
    fn batch(&self, items: Vec<VolumeItem>, device: &B::Device) -> VolumeBatch<B> {
        let batch_size = items.len();
        assert!(batch_size > 0, "Cannot create a batch from an empty Vec");

        let VolumeShape {
            depth,
            height,
            width,
            channels,
        } = self.shape;
        let modalities = items[0].volumes.len();

        let volumes = (0..modalities)
            .map(|m| {
                let mut voxels = Vec::with_capacity(batch_size * self.shape.len());
                for item in items.iter() {
                    voxels.extend_from_slice(&item.volumes[m]);
                }

                Tensor::<B, 5>::from_data(
                    TensorData::new(voxels, [batch_size, depth, height, width, channels]),
                    device,
                )
                .permute([0, 4, 1, 2, 3])
            })
            .collect();

        let labels: Vec<usize> = items.iter().map(|i| i.label).collect();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(
                labels
                    .iter()
                    .map(|l| (*l as i64).elem::<B::IntElem>())
                    .collect::<Vec<_>>(),
                [batch_size],
            ),
            device,
        );

        VolumeBatch {
            patients: items.into_iter().map(|i| i.patient).collect(),
            volumes,
            targets,
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_batch_moves_channels_first() {
        let device = Default::default();
        let shape = VolumeShape::new(1, 2, 2, 2);
        // channel-last: voxel (0,y,x) holds [c0, c1]
        let item = |patient: &str, label: usize, offset: f32| VolumeItem {
            patient: patient.to_string(),
            volumes: vec![(0..8).map(|v| v as f32 + offset).collect()],
            label,
        };
        let batcher = VolumeBatcher::<TestBackend>::new(shape);

        let batch = batcher.batch(vec![item("P1", 0, 0.0), item("P2", 1, 100.0)], &device);

        assert_eq!(batch.patients, vec!["P1", "P2"]);
        assert_eq!(batch.volumes.len(), 1);
        assert_eq!(batch.volumes[0].dims(), [2, 2, 1, 2, 2]);

        let first_channel: Vec<f32> = batch.volumes[0]
            .clone()
            .slice([0..1, 0..1, 0..1, 0..2, 0..2])
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(first_channel, vec![0.0, 2.0, 4.0, 6.0]);

        let targets: Vec<i64> = batch.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(targets, vec![0, 1]);
    }

    #[test]
    fn test_batch_keeps_modality_order() {
        let device = Default::default();
        let shape = VolumeShape::new(1, 1, 1, 1);
        let batcher = VolumeBatcher::<TestBackend>::new(shape);

        let batch = batcher.batch(
            vec![VolumeItem {
                patient: "P1".to_string(),
                volumes: vec![vec![1.0], vec![2.0], vec![3.0]],
                label: 1,
            }],
            &device,
        );

        let values: Vec<f32> = batch
            .volumes
            .iter()
            .map(|v| v.clone().into_scalar())
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }
}
