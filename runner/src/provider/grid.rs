//! Searchlights over a regular voxel grid.
//!
//! Masks are YAML documents holding the grid dimensions and one 0/1 value per
//! voxel in x-fastest order. A searchlight is centered on every voxel that is
//! set in both the process and the brain mask and contains every brain voxel
//! within `radius` (euclidean, in voxels) of that center.

use super::{ProviderError, Selection, UnitProvider, Volume};
use crate::config::MaskConfig;
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path};
use tracing::{debug, info};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MaskImage {
    pub dims: [usize; 3],
    pub voxels: Vec<u8>,
}

impl MaskImage {
    pub fn load(path: &Path) -> Result<Self, ProviderError> {
        let file = File::open(path).map_err(|source| ProviderError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mask: Self = serde_yaml::from_reader(file)?;
        mask.validate()?;

        Ok(mask)
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        let expected = self.dims.iter().product::<usize>();

        if self.voxels.len() != expected {
            Err(ProviderError::InvalidMask(format!(
                "{:?} needs {expected} voxels, found {}",
                self.dims,
                self.voxels.len()
            )))
        } else {
            Ok(())
        }
    }

    fn is_set(&self, [x, y, z]: [usize; 3]) -> bool {
        self.voxels[flat_index(self.dims, [x, y, z])] != 0
    }
}

pub fn flat_index(dims: [usize; 3], [x, y, z]: [usize; 3]) -> usize {
    x + dims[0] * (y + dims[1] * z)
}

fn coords(dims: [usize; 3], flat: usize) -> [usize; 3] {
    [
        flat % dims[0],
        (flat / dims[0]) % dims[1],
        flat / (dims[0] * dims[1]),
    ]
}

#[derive(Debug, Clone)]
pub struct GridMasks {
    dims: [usize; 3],
    // flat volume index of each unit's center
    positions: Vec<usize>,
    units: Vec<Selection>,
}

impl GridMasks {
    pub fn load(config: &MaskConfig) -> Result<Self, ProviderError> {
        let brain = MaskImage::load(&config.brain)?;
        let process = match config.process {
            Some(ref path) => MaskImage::load(path)?,
            None => brain.clone(),
        };

        Self::build(&brain, &process, config.radius)
    }

    pub fn build(
        brain: &MaskImage,
        process: &MaskImage,
        radius: f64,
    ) -> Result<Self, ProviderError> {
        brain.validate()?;
        process.validate()?;

        if brain.dims != process.dims {
            return Err(ProviderError::DimensionMismatch(brain.dims, process.dims));
        }
        if !radius.is_finite() || radius < 0.0 {
            return Err(ProviderError::InvalidMask(format!(
                "radius must be finite and non-negative, got {radius}"
            )));
        }

        let dims = brain.dims;
        // no searchlight reaches past the widest axis
        let widest = dims.iter().copied().max().unwrap_or(0);
        let reach = (radius.floor() as usize).min(widest);
        let radius_squared = radius * radius;

        let positions = (0..brain.voxels.len())
            .filter(|&flat| brain.voxels[flat] != 0 && process.voxels[flat] != 0)
            .collect::<Vec<_>>();

        let units = positions
            .iter()
            .map(|&flat| {
                let center = coords(dims, flat);
                let low = |axis: usize| center[axis].saturating_sub(reach);
                let high = |axis: usize| center[axis].saturating_add(reach).min(dims[axis] - 1);
                let mut voxels = Vec::new();

                // visit the bounding cube in x-fastest order so selections stay sorted
                for z in low(2)..=high(2) {
                    for y in low(1)..=high(1) {
                        for x in low(0)..=high(0) {
                            let distance_squared = [x, y, z]
                                .iter()
                                .zip(center.iter())
                                .map(|(&a, &b)| (a as f64 - b as f64).powi(2))
                                .sum::<f64>();

                            if distance_squared <= radius_squared && brain.is_set([x, y, z]) {
                                voxels.push([x, y, z]);
                            }
                        }
                    }
                }

                Selection { center, voxels }
            })
            .collect::<Vec<_>>();

        info!(units = units.len(), dims = ?dims, radius, "Built searchlights");
        if let Some(first) = units.first() {
            debug!("Each searchlight has on the order of {} voxels", first.voxels.len());
        }

        Ok(Self {
            dims,
            positions,
            units,
        })
    }
}

impl UnitProvider for GridMasks {
    fn units(&self) -> &[Selection] {
        &self.units
    }

    fn inverse_transform(&self, flat: &[f64]) -> Result<Volume, ProviderError> {
        if flat.len() != self.positions.len() {
            return Err(ProviderError::LengthMismatch {
                expected: self.positions.len(),
                found: flat.len(),
            });
        }

        let mut volume = Volume::zeros(self.dims);
        for (&position, &value) in self.positions.iter().zip(flat) {
            volume.data[position] = value;
        }

        Ok(volume)
    }

    fn select(&self, volume: &Volume) -> Result<Vec<f64>, ProviderError> {
        if volume.dims != self.dims {
            return Err(ProviderError::DimensionMismatch(self.dims, volume.dims));
        }
        let expected = self.dims.iter().product::<usize>();
        if volume.data.len() != expected {
            return Err(ProviderError::LengthMismatch {
                expected,
                found: volume.data.len(),
            });
        }

        Ok(self
            .positions
            .iter()
            .map(|&position| volume.data[position])
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{flat_index, GridMasks, MaskImage};
    use crate::provider::{ProviderError, UnitProvider, Volume};

    fn full(dims: [usize; 3]) -> MaskImage {
        MaskImage {
            dims,
            voxels: vec![1; dims.iter().product()],
        }
    }

    #[test]
    fn process_mask_restricts_centers() {
        let brain = full([3, 3, 1]);
        let mut process = MaskImage {
            dims: [3, 3, 1],
            voxels: vec![0; 9],
        };
        process.voxels[flat_index([3, 3, 1], [1, 1, 0])] = 1;
        process.voxels[flat_index([3, 3, 1], [2, 2, 0])] = 1;

        let masks = GridMasks::build(&brain, &process, 1.0).unwrap();
        let units = masks.units();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].center, [1, 1, 0]);
        // plus shaped neighbourhood, diagonal neighbours are sqrt(2) away
        assert_eq!(
            units[0].voxels,
            vec![[1, 0, 0], [0, 1, 0], [1, 1, 0], [2, 1, 0], [1, 2, 0]]
        );
        // corner center is clipped by the grid
        assert_eq!(units[1].voxels, vec![[2, 1, 0], [1, 2, 0], [2, 2, 0]]);
    }

    #[test]
    fn selections_stay_inside_the_brain() {
        let mut brain = full([4, 1, 1]);
        brain.voxels[3] = 0;
        let masks = GridMasks::build(&brain, &full([4, 1, 1]), 2.0).unwrap();

        // the process voxel outside the brain is not a unit
        assert_eq!(masks.units().len(), 3);
        assert_eq!(masks.units()[2].voxels, vec![[0, 0, 0], [1, 0, 0], [2, 0, 0]]);
    }

    #[test]
    fn volume_round_trip() {
        let brain = full([2, 2, 2]);
        let mut process = full([2, 2, 2]);
        process.voxels[0] = 0;
        process.voxels[5] = 0;
        let masks = GridMasks::build(&brain, &process, 0.0).unwrap();
        let values = vec![0.5, -1.25, 3.0, 1e-9, 7.0, 0.0];

        let volume = masks.inverse_transform(&values).unwrap();

        assert_eq!(volume.data[0], 0.0);
        assert_eq!(volume.data[1], 0.5);
        assert_eq!(masks.select(&volume).unwrap(), values);
    }

    #[test]
    fn mismatches_are_rejected() {
        let masks = GridMasks::build(&full([2, 1, 1]), &full([2, 1, 1]), 1.0).unwrap();

        assert!(matches!(
            masks.inverse_transform(&[1.0]),
            Err(ProviderError::LengthMismatch {
                expected: 2,
                found: 1
            })
        ));
        assert!(matches!(
            GridMasks::build(&full([2, 1, 1]), &full([1, 2, 1]), 1.0),
            Err(ProviderError::DimensionMismatch(..))
        ));
        assert!(matches!(
            MaskImage {
                dims: [2, 2, 1],
                voxels: vec![1; 3]
            }
            .validate(),
            Err(ProviderError::InvalidMask(_))
        ));
    }

    #[test]
    fn oversized_radius_covers_the_whole_brain() {
        let mask = full([3, 1, 1]);
        let masks = GridMasks::build(&mask, &mask, 1e300).unwrap();

        for unit in masks.units() {
            assert_eq!(unit.voxels, vec![[0, 0, 0], [1, 0, 0], [2, 0, 0]]);
        }
        assert!(matches!(
            GridMasks::build(&mask, &mask, f64::INFINITY),
            Err(ProviderError::InvalidMask(_))
        ));
    }

    #[test]
    fn short_volumes_are_rejected() {
        let masks = GridMasks::build(&full([2, 2, 1]), &full([2, 2, 1]), 0.0).unwrap();
        let volume: Volume = serde_yaml::from_str("dims: [2, 2, 1]\ndata: [1.0, 2.0]\n").unwrap();

        assert!(matches!(
            masks.select(&volume),
            Err(ProviderError::LengthMismatch {
                expected: 4,
                found: 2
            })
        ));
    }

    #[test]
    fn masks_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brain.yaml");
        std::fs::write(&path, "dims: [2, 1, 1]\nvoxels: [1, 0]\n").unwrap();

        let mask = MaskImage::load(&path).unwrap();

        assert_eq!(mask.voxels, vec![1, 0]);
    }
}
