use crate::{
    config::TerrainConfig,
    debug::DebugTerrain,
    terrain::{
        collect_terrain_draws, initialize_terrains, load_terrain_configs, read_back_elevation,
        remove_terrains, sync_terrain_tiles, update_quadtrees, ElevationReadbacks, TileCaches,
        TileSources,
    },
};
use bevy::prelude::*;
use bevy_common_assets::ron::RonAssetPlugin;

/// The plugin adapting the terrains to the [`TerrainView`](crate::terrain_view::TerrainView).
///
/// The sources of the tile storages have to be registered in the [`TileSources`] before
/// a terrain using them is spawned.
pub struct TerrainPlugin;

impl Plugin for TerrainPlugin {
    fn build(&self, app: &mut App) {
        app.add_plugins(RonAssetPlugin::<TerrainConfig>::new(&["terrain.ron"]))
            .init_resource::<TileSources>()
            .init_resource::<TileCaches>()
            .init_resource::<ElevationReadbacks>()
            .init_resource::<DebugTerrain>()
            .add_systems(
                Last,
                (
                    load_terrain_configs,
                    initialize_terrains.after(load_terrain_configs),
                    update_quadtrees.after(initialize_terrains),
                    sync_terrain_tiles.after(update_quadtrees),
                    read_back_elevation.after(sync_terrain_tiles),
                    collect_terrain_draws.after(read_back_elevation),
                    remove_terrains.after(collect_terrain_draws),
                ),
            );
    }
}
