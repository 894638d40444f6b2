//! Contains a debug resource and systems controlling it to inspect the quadtree of
//! the terrains.
use crate::terrain::Terrain;
use bevy::{color::palettes::basic, prelude::*};

/// Adds the debug controls and the quadtree visualization.
pub struct TerrainDebugPlugin;

impl Plugin for TerrainDebugPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<DebugTerrain>()
            .add_systems(Update, (toggle_debug, show_quadtree));
    }
}

#[derive(Clone, Debug, Resource)]
pub struct DebugTerrain {
    /// Stops the quadtrees and tiles from adapting to the view.
    pub freeze: bool,
    pub horizon_culling: bool,
    /// Outlines the visible leaf quads.
    pub show_quadtree: bool,
}

impl Default for DebugTerrain {
    fn default() -> Self {
        Self {
            freeze: false,
            horizon_culling: true,
            show_quadtree: false,
        }
    }
}

pub fn toggle_debug(input: Res<ButtonInput<KeyCode>>, mut debug_terrain: ResMut<DebugTerrain>) {
    if input.just_pressed(KeyCode::KeyF) {
        debug_terrain.freeze = !debug_terrain.freeze;
        info!(
            "Toggled the frozen view {}.",
            if debug_terrain.freeze { "on" } else { "off" }
        )
    }
    if input.just_pressed(KeyCode::KeyH) {
        debug_terrain.horizon_culling = !debug_terrain.horizon_culling;
        info!(
            "Toggled the horizon culling {}.",
            if debug_terrain.horizon_culling { "on" } else { "off" }
        )
    }
    if input.just_pressed(KeyCode::KeyQ) {
        debug_terrain.show_quadtree = !debug_terrain.show_quadtree;
        info!(
            "Toggled the quadtree view {}.",
            if debug_terrain.show_quadtree { "on" } else { "off" }
        )
    }
}

const LEVEL_COLORS: [Srgba; 6] = [
    basic::RED,
    basic::YELLOW,
    basic::GREEN,
    basic::AQUA,
    basic::BLUE,
    basic::FUCHSIA,
];

pub(crate) fn show_quadtree(
    debug: Res<DebugTerrain>,
    mut gizmos: Gizmos,
    terrains: Query<(&Terrain, Option<&GlobalTransform>)>,
) {
    if !debug.show_quadtree {
        return;
    }

    for (terrain, transform) in &terrains {
        let transform = transform.unwrap_or(&GlobalTransform::IDENTITY);
        let deformation = terrain.quadtree.deformation;

        for (_, quad) in terrain
            .quadtree
            .leaves()
            .filter(|(_, quad)| quad.is_visible())
        {
            let corners = quad.local_box().corners(quad.zmax).map(|corner| {
                transform.transform_point(deformation.to_deformed(corner).as_vec3())
            });

            let color = LEVEL_COLORS[quad.level() as usize % LEVEL_COLORS.len()];

            gizmos.linestrip(corners.into_iter().chain([corners[0]]), color);
        }
    }
}
