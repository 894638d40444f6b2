use crate::{
    error::{TerrainError, TerrainResult},
    math::Deformation,
    terrain_data::{quadtree::QuadtreeSettings, tile_tree::SamplerPolicy, QuadCoordinate},
};
use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// How the elevation bounds of the quads are read back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadbackConfig {
    /// The number of readbacks started per frame.
    pub max_per_frame: usize,
    /// The number of frames until a readback is delivered.
    pub delay: usize,
}

impl Default for ReadbackConfig {
    fn default() -> Self {
        Self {
            max_per_frame: 1,
            delay: 3,
        }
    }
}

/// A kind of data sampled by the terrain, like its elevation or its color.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub name: String,
    /// The tile storage, samplers using the same storage share their tiles.
    pub storage: String,
    /// The number of tiles the storage holds, taken from the first sampler creating it.
    pub capacity: u32,
    pub policy: SamplerPolicy,
    /// Whether the elevation bounds of the quads are read back from this sampler.
    pub elevation: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            name: "elevation".into(),
            storage: "elevation".into(),
            capacity: 256,
            policy: SamplerPolicy::default(),
            elevation: true,
        }
    }
}

/// The configuration of a terrain, usually loaded from a `*.terrain.ron` file.
#[derive(Asset, TypePath, Component, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    pub deformation: Deformation,
    pub quadtree: QuadtreeSettings,
    /// The number of cells per side of the quad mesh.
    pub grid_size: u32,
    pub readback: ReadbackConfig,
    /// The number of background production tasks executed per frame.
    pub tasks_per_frame: usize,
    pub samplers: Vec<SamplerConfig>,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            deformation: Deformation::default(),
            quadtree: QuadtreeSettings::default(),
            grid_size: 24,
            readback: ReadbackConfig::default(),
            tasks_per_frame: 16,
            samplers: vec![SamplerConfig::default()],
        }
    }
}

impl TerrainConfig {
    pub fn load_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let encoded = fs::read_to_string(path)?;
        let config: Self = ron::from_str(&encoded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let encoded = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Whether any sampler acquires its tiles asynchronously.
    pub fn is_asynchronous(&self) -> bool {
        self.samplers
            .iter()
            .any(|sampler| sampler.policy.asynchronous)
    }

    pub fn validate(&self) -> TerrainResult<()> {
        let invalid = |reason: String| Err(TerrainError::InvalidConfig(reason));

        if self.quadtree.split_factor <= 1.0 {
            return invalid(format!(
                "the split factor has to be greater than one, but is {}",
                self.quadtree.split_factor
            ));
        }

        if self.quadtree.max_level > QuadCoordinate::MAX_LEVEL {
            return invalid(format!(
                "the maximum level {} is deeper than {}",
                self.quadtree.max_level,
                QuadCoordinate::MAX_LEVEL
            ));
        }

        if self.quadtree.size <= 0.0 {
            return invalid(format!("the terrain size {} is not positive", self.quadtree.size));
        }

        if self.grid_size == 0 || self.grid_size % 2 != 0 {
            return invalid(format!("the grid size {} is not even", self.grid_size));
        }

        if self.readback.delay == 0 || self.readback.max_per_frame == 0 {
            return invalid("readbacks require a delay and a limit of at least one".into());
        }

        if let Deformation::Cylinder { radius } | Deformation::Sphere { radius } = self.deformation {
            if radius <= 0.0 {
                return invalid(format!("the deformation radius {radius} is not positive"));
            }
        }

        for (index, sampler) in self.samplers.iter().enumerate() {
            if sampler.policy.asynchronous && !sampler.policy.store_parent {
                return Err(TerrainError::InvalidPolicy(sampler.name.clone()));
            }

            if self.samplers[..index]
                .iter()
                .any(|other| other.name == sampler.name)
            {
                return invalid(format!("the sampler '{}' is defined twice", sampler.name));
            }
        }

        if self.samplers.iter().filter(|sampler| sampler.elevation).count() > 1 {
            return invalid("only a single sampler may provide the elevation".into());
        }

        Ok(())
    }
}
