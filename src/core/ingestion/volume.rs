use super::Error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Shape of one volumetric image as stored on disk: depth x height x width x channels,
/// channel-last, row-major.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeShape {
    pub depth: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl VolumeShape {
    pub fn new(depth: usize, height: usize, width: usize, channels: usize) -> Self {
        Self {
            depth,
            height,
            width,
            channels,
        }
    }

    /// Number of voxel values in one volume.
    pub fn len(&self) -> usize {
        self.depth * self.height * self.width * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spatial(&self) -> [usize; 3] {
        [self.depth, self.height, self.width]
    }
}

/// Decodes a volume file into channel-last voxel values.
pub trait VolumeReader: Send + Sync {
    fn read(&self, path: &Path, shape: &VolumeShape) -> Result<Vec<f32>, Error>;
}

/// Reads headerless little-endian `f32` voxel dumps.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawVolumeReader;

impl VolumeReader for RawVolumeReader {
    fn read(&self, path: &Path, shape: &VolumeShape) -> Result<Vec<f32>, Error> {
        let bytes = fs::read(path)?;

        if bytes.len() != shape.len() * 4 {
            return Err(Error::VolumeSize {
                path: path.to_path_buf(),
                expected: shape.len(),
                got: bytes.len() / 4,
            });
        }

        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}
