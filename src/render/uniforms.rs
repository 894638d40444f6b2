use crate::terrain_data::{
    quadtree::{QuadKey, TerrainQuadtree},
    tile_tree::{TileCoords, TileLookup},
};
use bevy::{
    math::{DMat4, DVec3, DVec4, Mat3, Mat4, Vec2, Vec3, Vec4},
    render::render_resource::ShaderType,
    utils::HashMap,
};
use std::sync::Arc;

/// The per quad data of the deformation.
#[derive(Clone, Copy, Debug, Default, ShaderType)]
pub struct QuadUniform {
    /// The lower left corner, the size and the level of the quad.
    pub offset: Vec4,
    /// The camera relative to the quad, in units of its size.
    pub camera: Vec4,
    /// The distances between which the quad morphs into its parent.
    pub blending: Vec2,
    /// The corners of the quad at zero elevation, in clip space.
    pub screen_quad_corners: Mat4,
    /// The upward directions at the corners of the quad, in clip space.
    pub screen_quad_verticals: Mat4,
}

impl QuadUniform {
    pub fn new(quadtree: &TerrainQuadtree, key: QuadKey) -> Self {
        let quad = quadtree.node(key);
        let deformation = &quadtree.deformation;
        let camera = quadtree.local_camera();
        let clip_from_deformed = quadtree.clip_from_deformed();
        let split_distance = quadtree.split_distance();

        let corners = [
            DVec3::new(quad.ox, quad.oy, 0.0),
            DVec3::new(quad.ox + quad.l, quad.oy, 0.0),
            DVec3::new(quad.ox, quad.oy + quad.l, 0.0),
            DVec3::new(quad.ox + quad.l, quad.oy + quad.l, 0.0),
        ];

        let screen_corners = corners.map(|corner| {
            clip_from_deformed * deformation.to_deformed(corner).extend(1.0)
        });
        let screen_verticals = corners.map(|corner| {
            let vertical = deformation.to_deformed(corner.with_z(1.0)) - deformation.to_deformed(corner);
            clip_from_deformed * vertical.extend(0.0)
        });

        Self {
            offset: DVec4::new(quad.ox, quad.oy, quad.l, quad.level() as f64).as_vec4(),
            camera: DVec4::new(
                (camera.x - quad.ox) / quad.l,
                (camera.y - quad.oy) / quad.l,
                (camera.z - quadtree.ground.current) / (quad.l * quadtree.dist_factor()),
                camera.z,
            )
            .as_vec4(),
            blending: Vec2::new(split_distance as f32 + 1.0, split_distance as f32 - 1.0),
            screen_quad_corners: DMat4::from_cols_array_2d(&screen_corners.map(|c| c.to_array()))
                .as_mat4(),
            screen_quad_verticals: DMat4::from_cols_array_2d(
                &screen_verticals.map(|v| v.to_array()),
            )
            .as_mat4(),
        }
    }
}

/// The per terrain data of the deformation.
#[derive(Clone, Copy, Debug, Default, ShaderType)]
pub struct TerrainUniform {
    pub radius: f32,
    pub ground_height: f32,
    /// The camera in deformed space.
    pub camera: Vec3,
    /// The rotation of the frame tangent to the terrain below the camera.
    pub tangent_frame: Mat3,
}

impl TerrainUniform {
    pub fn new(quadtree: &TerrainQuadtree) -> Self {
        let deformation = &quadtree.deformation;
        let camera = quadtree.deformed_camera();
        let frame = deformation.tangent_frame(camera);

        Self {
            radius: deformation.radius() as f32,
            ground_height: quadtree.ground.current as f32,
            camera: camera.as_vec3(),
            tangent_frame: Mat3::from_cols(
                frame.x_axis.truncate().as_vec3(),
                frame.y_axis.truncate().as_vec3(),
                frame.z_axis.truncate().as_vec3(),
            ),
        }
    }
}

/// Where the data of a quad is found inside the tile pool texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, ShaderType)]
pub struct TileUniform {
    /// The uv offset of the quad (xy) and the layer of its tile (z).
    pub coords: Vec3,
    /// The uv size of the quad (xy) and the size of the tiles in samples (z).
    pub size: Vec3,
    pub parent_coords: Vec3,
    pub parent_size: Vec3,
    /// Whether the parent coordinates are valid and may be blended with.
    pub blend: f32,
}

impl TileUniform {
    pub fn new(lookup: &TileLookup, tile_size: u32, border: u32) -> Self {
        let (coords, size) = Self::coords(&lookup.tile, tile_size, border);
        let (parent_coords, parent_size) = lookup
            .parent
            .map_or((coords, size), |parent| Self::coords(&parent, tile_size, border));

        Self {
            coords,
            size,
            parent_coords,
            parent_size,
            blend: if lookup.parent.is_some() { 1.0 } else { 0.0 },
        }
    }

    fn coords(tile: &TileCoords, tile_size: u32, border: u32) -> (Vec3, Vec3) {
        let interior = tile_size.saturating_sub(2 * border) as f64;
        let texel = 1.0 / tile_size as f64;

        let offset = (border as f64 + tile.offset * interior) * texel;
        let scale = tile.scale * interior * texel;

        (
            offset.as_vec2().extend(tile.slot as f32),
            Vec3::new(scale as f32, scale as f32, tile_size as f32),
        )
    }
}

/// The uniform names of a GPU program and the slots they are bound to.
#[derive(Clone, Debug, Default)]
pub struct ProgramLayout {
    pub id: u64,
    pub uniforms: HashMap<String, u32>,
}

/// The resolved uniform slots of one program.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindingSnapshot {
    pub program: u64,
    slots: HashMap<String, u32>,
}

impl BindingSnapshot {
    pub fn slot(&self, name: &str) -> Option<u32> {
        self.slots.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// The deformation uniforms every terrain program may declare.
pub const DEFORMATION_UNIFORMS: [&str; 7] = [
    "deformation.offset",
    "deformation.camera",
    "deformation.blending",
    "deformation.screen_quad_corners",
    "deformation.screen_quad_verticals",
    "deformation.radius",
    "deformation.tangent_frame",
];

/// Resolves the uniforms of the terrain against the program drawing it.
///
/// The slots are only looked up again when the program changes. Each lookup builds a
/// new snapshot, which replaces the previous one as a whole, so that readers holding
/// the old snapshot are unaffected.
#[derive(Clone, Debug, Default)]
pub struct UniformBindings {
    names: Vec<String>,
    snapshot: Option<Arc<BindingSnapshot>>,
}

impl UniformBindings {
    pub fn new<'a>(samplers: impl IntoIterator<Item = &'a str>) -> Self {
        let mut names = DEFORMATION_UNIFORMS.map(String::from).to_vec();

        for sampler in samplers {
            names.extend(["tile", "coords", "parent"].map(|suffix| format!("{sampler}.{suffix}")));
        }

        Self {
            names,
            snapshot: None,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn snapshot(&self) -> Option<Arc<BindingSnapshot>> {
        self.snapshot.clone()
    }

    pub fn resolve(&mut self, program: &ProgramLayout) -> Arc<BindingSnapshot> {
        if let Some(snapshot) = &self.snapshot {
            if snapshot.program == program.id {
                return snapshot.clone();
            }
        }

        let slots = self
            .names
            .iter()
            .filter_map(|name| {
                let slot = program.uniforms.get(name)?;
                Some((name.clone(), *slot))
            })
            .collect();

        let snapshot = Arc::new(BindingSnapshot {
            program: program.id,
            slots,
        });
        self.snapshot = Some(snapshot.clone());

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        math::Deformation,
        terrain_data::{
            quadtree::tests::{settings, view},
            QuadCoordinate,
        },
    };
    use bevy::math::DVec2;

    fn program(id: u64, names: &[&str]) -> ProgramLayout {
        ProgramLayout {
            id,
            uniforms: names
                .iter()
                .enumerate()
                .map(|(slot, name)| (name.to_string(), slot as u32))
                .collect(),
        }
    }

    #[test]
    fn bindings_are_only_resolved_for_new_programs() {
        let mut bindings = UniformBindings::new(["elevation", "color"]);
        assert_eq!(bindings.names().len(), 7 + 6);

        let first = bindings.resolve(&program(1, &["deformation.offset", "elevation.tile", "other"]));
        assert_eq!(first.len(), 2);
        assert_eq!(first.slot("elevation.tile"), Some(1));
        assert_eq!(first.slot("other"), None);

        // the same program keeps the published snapshot
        let again = bindings.resolve(&program(1, &[]));
        assert!(Arc::ptr_eq(&first, &again));

        let second = bindings.resolve(&program(2, &["color.coords"]));
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.slot("color.coords"), Some(0));
        assert_eq!(first.slot("elevation.tile"), Some(1));
        assert!(Arc::ptr_eq(&bindings.snapshot().unwrap(), &second));
    }

    #[test]
    fn tile_uniform_skips_the_border() {
        let lookup = TileLookup {
            tile: TileCoords {
                coordinate: QuadCoordinate::new(1, 0, 0),
                slot: 3,
                offset: DVec2::new(0.5, 0.0),
                scale: 0.5,
            },
            parent: None,
        };

        let uniform = TileUniform::new(&lookup, 10, 1);

        assert_eq!(uniform.coords, Vec3::new(0.5, 0.1, 3.0));
        assert_eq!(uniform.size, Vec3::new(0.4, 0.4, 10.0));
        assert_eq!(uniform.parent_coords, uniform.coords);
        assert_eq!(uniform.blend, 0.0);
    }

    #[test]
    fn quad_uniform_places_the_camera_relative_to_the_quad() {
        let mut quadtree = TerrainQuadtree::new(Deformation::Identity, settings(2));
        quadtree.update(&view(DVec3::new(0.5, 0.5, 0.5), DVec3::ZERO, DVec3::Z));

        let uniform = QuadUniform::new(&quadtree, quadtree.root());

        assert_eq!(uniform.offset, Vec4::new(-1.0, -1.0, 2.0, 0.0));
        assert_eq!(uniform.camera, Vec4::new(0.75, 0.75, 0.25, 0.5));
        assert_eq!(uniform.blending, Vec2::new(3.0, 1.0));

        // the verticals of a flat terrain are all the same
        let verticals = uniform.screen_quad_verticals;
        assert_eq!(verticals.x_axis, verticals.w_axis);

        let terrain = TerrainUniform::new(&quadtree);
        assert_eq!(terrain.radius, 0.0);
        assert_eq!(terrain.camera, Vec3::new(0.5, 0.5, 0.5));
    }
}
