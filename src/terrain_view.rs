use crate::terrain_data::quadtree::ViewInput;
use bevy::{
    math::{DMat4, DVec3},
    prelude::*,
};

/// Marks the camera the terrains adapt their level of detail to.
///
/// If several cameras are marked, the first active one is used.
#[derive(Clone, Copy, Default, Component)]
pub struct TerrainView;

/// Computes the view input of a terrain from the matrices of the camera and the terrain.
///
/// The deformed space of the terrain is its local space in the world.
pub fn terrain_view_input(
    clip_from_view: DMat4,
    world_from_view: DMat4,
    world_from_terrain: DMat4,
    viewport_width: f64,
) -> ViewInput {
    let terrain_from_world = world_from_terrain.inverse();
    let terrain_from_view = terrain_from_world * world_from_view;

    // the camera looks down its negative z axis
    let deformed_direction = terrain_from_view
        .transform_vector3(DVec3::NEG_Z)
        .normalize_or_zero();

    ViewInput {
        clip_from_deformed: clip_from_view * world_from_view.inverse() * world_from_terrain,
        deformed_camera: terrain_from_view.transform_point3(DVec3::ZERO),
        deformed_direction,
        viewport_width,
    }
}

/// Computes the view input of a terrain for the given camera.
///
/// Returns `None` while the camera has no viewport.
pub fn camera_view_input(
    camera: &Camera,
    camera_transform: &GlobalTransform,
    terrain_transform: &GlobalTransform,
) -> Option<ViewInput> {
    let viewport = camera.physical_viewport_size()?;

    if viewport.x == 0 {
        return None;
    }

    Some(terrain_view_input(
        camera.clip_from_view().as_dmat4(),
        camera_transform.compute_matrix().as_dmat4(),
        terrain_transform.compute_matrix().as_dmat4(),
        viewport.x as f64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy::math::{DVec2, DVec4};

    #[test]
    fn view_input_is_relative_to_the_terrain() {
        let world_from_view = DMat4::look_at_rh(
            DVec3::new(10.0, 0.0, 5.0),
            DVec3::new(10.0, 10.0, 5.0),
            DVec3::Z,
        )
        .inverse();
        let world_from_terrain = DMat4::from_translation(DVec3::new(10.0, 0.0, 0.0));
        let clip_from_view = DMat4::perspective_infinite_reverse_rh(1.0, 1.0, 0.1);

        let view = terrain_view_input(clip_from_view, world_from_view, world_from_terrain, 800.0);

        assert!(view.deformed_camera.abs_diff_eq(DVec3::new(0.0, 0.0, 5.0), 1e-9));
        assert!(view.deformed_direction.abs_diff_eq(DVec3::Y, 1e-9));
        assert_eq!(view.viewport_width, 800.0);

        // a point in front of the camera ends up in the middle of the screen
        let clip = view.clip_from_deformed * DVec4::new(0.0, 10.0, 5.0, 1.0);
        assert!((clip.truncate() / clip.w).truncate().abs_diff_eq(DVec2::ZERO, 1e-9));
    }
}
