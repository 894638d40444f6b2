//! This crate adapts the level of detail of large terrains, up to the size of planets,
//! to the view of a camera.
//!
//! # Background
//! Each terrain is a quadtree over a flat square, which is deformed into its final
//! shape, like a cylinder or a sphere.
//! Each frame the quadtree is refined near the camera and coarsened far away from it,
//! and quads outside of the view frustum or hidden behind the horizon are culled.
//! See the [`terrain_data`] module for more information.
//!
//! The data of the quads, like their elevation, is stored in tiles.
//! Tiles are produced on demand by a [`TileSource`](terrain_data::tile_cache::TileSource)
//! and kept in a fixed size cache, which is shared by all terrains using the same storage.
//! Samplers can either wait for their tiles to be produced, or draw the coarser data of
//! the ancestors until they become available.
//!
//! The elevation bounds of the quads are not known in advance.
//! They are read back from the elevation tiles with a fixed latency and refine the
//! culling over the following frames.
//! See the [`render`] module for more information.

use crate::config::TerrainConfig;
use bevy::prelude::*;

pub mod config;
pub mod debug;
pub mod error;
pub mod math;
pub mod plugin;
pub mod render;
pub mod shared;
pub mod terrain;
pub mod terrain_data;
pub mod terrain_view;

#[allow(missing_docs)]
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        config::{ReadbackConfig, SamplerConfig, TerrainConfig},
        debug::{DebugTerrain, TerrainDebugPlugin},
        error::{TerrainError, TerrainResult},
        math::Deformation,
        plugin::TerrainPlugin,
        render::{
            draw::{DrawCommand, DrawRanges},
            uniforms::ProgramLayout,
        },
        terrain::{Terrain, TerrainConfigHandle, TerrainProgram, TileCaches, TileSources},
        terrain_data::{
            quadtree::{QuadtreeSettings, TerrainQuadtree},
            tile_cache::{HeightFunctionSource, TileSource},
            tile_tree::SamplerPolicy,
            QuadCoordinate,
        },
        terrain_view::TerrainView,
        TerrainBundle,
    };
}

/// The components of a terrain entity.
///
/// Terrains loaded from an asset are spawned with a
/// [`TerrainConfigHandle`](terrain::TerrainConfigHandle) instead of
/// the config, which is inserted once the asset is available.
#[derive(Bundle)]
pub struct TerrainBundle {
    pub config: TerrainConfig,
    pub transform: Transform,
    pub global_transform: GlobalTransform,
}

impl TerrainBundle {
    pub fn new(config: TerrainConfig) -> Self {
        Self {
            config,
            transform: default(),
            global_transform: default(),
        }
    }
}
