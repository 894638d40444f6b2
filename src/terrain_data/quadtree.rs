use crate::{
    math::{Deformation, FrustumPlanes, LocalBox, QuadVisibility},
    terrain_data::{horizon::HorizonBuffer, QuadCoordinate},
};
use bevy::{
    log::trace,
    math::{DMat4, DVec2, DVec3},
};
use serde::{Deserialize, Serialize};
use slab::Slab;

/// The index of a [`QuadNode`] inside the arena of its [`TerrainQuadtree`].
pub type QuadKey = usize;

/// The order in which the children of a quad are visited, nearest to the camera first.
pub type ChildOrder = [usize; 4];

/// The parameters controlling the shape of a [`TerrainQuadtree`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadtreeSettings {
    /// Half the side length of the root quad, which spans `[-size, size]` in x and y.
    pub size: f64,
    /// The initial lower elevation bound of the root.
    pub zmin: f64,
    /// The initial upper elevation bound of the root.
    pub zmax: f64,
    /// How aggressively quads are subdivided, has to be greater than one.
    pub split_factor: f64,
    /// The deepest level quads are subdivided to.
    pub max_level: u32,
    /// Whether invisible quads are subdivided as well.
    pub split_invisible_quads: bool,
    /// Whether quads behind the terrain horizon are culled.
    pub horizon_culling: bool,
}

impl Default for QuadtreeSettings {
    fn default() -> Self {
        Self {
            size: 1.0,
            zmin: 0.0,
            zmax: 0.0,
            split_factor: 2.0,
            max_level: 16,
            split_invisible_quads: false,
            horizon_culling: true,
        }
    }
}

/// The data required to update the quadtree for one view.
#[derive(Clone, Copy, Debug)]
pub struct ViewInput {
    /// Maps deformed terrain space to clip space.
    pub clip_from_deformed: DMat4,
    /// The camera position in deformed space.
    pub deformed_camera: DVec3,
    /// The view direction in deformed space.
    pub deformed_direction: DVec3,
    /// The width of the viewport in pixels.
    pub viewport_width: f64,
}

/// The terrain height below the camera.
///
/// The readback writes `next` while the quadtree reads `current`, which is replaced
/// at the start of each update.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GroundHeight {
    pub current: f64,
    pub next: f64,
}

impl GroundHeight {
    pub fn publish(&mut self) {
        self.current = self.next;
    }
}

/// A quad of the [`TerrainQuadtree`].
#[derive(Clone, Debug)]
pub struct QuadNode {
    pub coordinate: QuadCoordinate,
    pub parent: Option<QuadKey>,
    /// The four children in the order bottom left, bottom right, top left, top right.
    pub children: Option<[QuadKey; 4]>,
    /// The x coordinate of the lower left corner in local space.
    pub ox: f64,
    /// The y coordinate of the lower left corner in local space.
    pub oy: f64,
    /// The side length in local space.
    pub l: f64,
    pub zmin: f64,
    pub zmax: f64,
    pub visible: QuadVisibility,
    /// Whether the quad was hidden behind the horizon during the last update.
    pub occluded: bool,
    /// Whether the data of this quad is ready to be drawn.
    pub drawable: bool,
}

impl QuadNode {
    fn new(
        coordinate: QuadCoordinate,
        parent: Option<QuadKey>,
        ox: f64,
        oy: f64,
        l: f64,
        zmin: f64,
        zmax: f64,
    ) -> Self {
        Self {
            coordinate,
            parent,
            children: None,
            ox,
            oy,
            l,
            zmin,
            zmax,
            visible: QuadVisibility::PartiallyVisible,
            occluded: false,
            drawable: true,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn level(&self) -> u32 {
        self.coordinate.level
    }

    pub fn is_visible(&self) -> bool {
        self.visible.is_visible()
    }

    pub fn local_box(&self) -> LocalBox {
        LocalBox::from_quad(self.ox, self.oy, self.l, self.zmin, self.zmax)
    }

    pub fn center(&self) -> DVec2 {
        DVec2::new(self.ox + 0.5 * self.l, self.oy + 0.5 * self.l)
    }
}

/// A view dependent quadtree, which refines itself around the camera each frame.
///
/// Quads are subdivided when they are close enough to the camera relative to their size
/// and merged otherwise.
/// Invisible quads, either outside the frustum or behind the horizon, are not refined
/// unless `split_invisible_quads` is set.
pub struct TerrainQuadtree {
    pub deformation: Deformation,
    pub settings: QuadtreeSettings,
    pub ground: GroundHeight,
    nodes: Slab<QuadNode>,
    root: QuadKey,
    deformed_camera: DVec3,
    local_camera: DVec3,
    clip_from_deformed: DMat4,
    frustum: FrustumPlanes,
    split_distance: f64,
    dist_factor: f64,
    horizon: HorizonBuffer,
}

impl TerrainQuadtree {
    pub fn new(deformation: Deformation, settings: QuadtreeSettings) -> Self {
        let mut nodes = Slab::new();

        let root = nodes.insert(QuadNode::new(
            QuadCoordinate::ROOT,
            None,
            -settings.size,
            -settings.size,
            2.0 * settings.size,
            settings.zmin,
            settings.zmax,
        ));

        Self {
            deformation,
            settings,
            ground: GroundHeight::default(),
            nodes,
            root,
            deformed_camera: DVec3::ZERO,
            local_camera: DVec3::ZERO,
            clip_from_deformed: DMat4::IDENTITY,
            frustum: FrustumPlanes::default(),
            split_distance: 1.1,
            dist_factor: 1.0,
            horizon: HorizonBuffer::default(),
        }
    }

    pub fn root(&self) -> QuadKey {
        self.root
    }

    pub fn node(&self, key: QuadKey) -> &QuadNode {
        &self.nodes[key]
    }

    pub fn node_mut(&mut self, key: QuadKey) -> &mut QuadNode {
        &mut self.nodes[key]
    }

    pub fn get(&self, key: QuadKey) -> Option<&QuadNode> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: QuadKey) -> bool {
        self.nodes.contains(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (QuadKey, &QuadNode)> {
        self.nodes.iter()
    }

    pub fn leaves(&self) -> impl Iterator<Item = (QuadKey, &QuadNode)> {
        self.nodes.iter().filter(|(_, node)| node.is_leaf())
    }

    pub fn deformed_camera(&self) -> DVec3 {
        self.deformed_camera
    }

    pub fn local_camera(&self) -> DVec3 {
        self.local_camera
    }

    pub fn clip_from_deformed(&self) -> DMat4 {
        self.clip_from_deformed
    }

    pub fn frustum(&self) -> &FrustumPlanes {
        &self.frustum
    }

    pub fn split_distance(&self) -> f64 {
        self.split_distance
    }

    pub fn dist_factor(&self) -> f64 {
        self.dist_factor
    }

    pub fn horizon(&self) -> &HorizonBuffer {
        &self.horizon
    }

    /// Looks up the quad with the given coordinate, if it is part of the current tree.
    pub fn find(&self, coordinate: QuadCoordinate) -> Option<QuadKey> {
        if !coordinate.is_valid() {
            return None;
        }

        let mut key = self.root;

        for depth in (0..coordinate.level).rev() {
            let children = self.nodes[key].children?;
            key = children[coordinate.ancestor(depth).child_index()];
        }

        Some(key)
    }

    /// Looks up the leaf containing the local position.
    pub fn find_leaf(&self, position: DVec2) -> Option<QuadKey> {
        if !self.nodes[self.root].local_box().contains_xy(position) {
            return None;
        }

        let mut key = self.root;

        while let Some(children) = self.nodes[key].children {
            let center = self.nodes[key].center();
            let index = usize::from(position.x >= center.x) + 2 * usize::from(position.y >= center.y);
            key = children[index];
        }

        Some(key)
    }

    /// Updates the elevation bounds of a quad. Returns false if the quad does not exist.
    pub fn set_elevation_bounds(&mut self, coordinate: QuadCoordinate, zmin: f64, zmax: f64) -> bool {
        match self.find(coordinate) {
            Some(key) => {
                let node = &mut self.nodes[key];
                node.zmin = zmin;
                node.zmax = zmax;
                true
            }
            None => false,
        }
    }

    /// The order in which the children of a quad are visited, nearest to the camera first.
    pub fn child_order(&self, key: QuadKey) -> ChildOrder {
        let center = self.nodes[key].center();
        let camera = self.local_camera;

        match (camera.y < center.y, camera.x < center.x) {
            (true, true) => [0, 1, 2, 3],
            (true, false) => [1, 0, 3, 2],
            (false, true) => [2, 0, 3, 1],
            (false, false) => [3, 1, 2, 0],
        }
    }

    /// Refines the quadtree for the given view.
    pub fn update(&mut self, view: &ViewInput) {
        self.ground.publish();

        self.deformed_camera = view.deformed_camera;
        self.local_camera = self.deformation.to_local(view.deformed_camera);
        self.clip_from_deformed = view.clip_from_deformed;
        self.frustum = FrustumPlanes::from_clip_from_local(view.clip_from_deformed);

        let differential = self.deformation.differential(self.local_camera, true);
        self.dist_factor = differential
            .x_axis
            .truncate()
            .length()
            .max(differential.y_axis.truncate().length());

        let fov = self.frustum.fov();
        let split_distance = self.settings.split_factor * view.viewport_width / 1024.0
            * 40f64.to_radians().tan()
            / (fov / 2.0).tan();

        self.split_distance = if split_distance.is_finite() && split_distance >= 1.1 {
            split_distance
        } else {
            1.1
        };

        let root_zmax = self.nodes[self.root].zmax;

        if self.settings.horizon_culling && self.local_camera.z <= root_zmax {
            let step = 1e-3 * self.settings.size;
            let target = self
                .deformation
                .to_local(view.deformed_camera + step * view.deformed_direction.normalize_or_zero());

            self.horizon
                .reset(self.local_camera, (target - self.local_camera).truncate());
        } else {
            self.horizon.disable();
        }

        self.update_quad(self.root, QuadVisibility::PartiallyVisible);

        trace!(
            "Updated terrain quadtree: {} quads, split distance {:.3}, horizon culling {}.",
            self.nodes.len(),
            self.split_distance,
            self.horizon.is_enabled()
        );
    }

    fn update_quad(&mut self, key: QuadKey, parent_visibility: QuadVisibility) {
        let local_box = self.nodes[key].local_box();

        let mut visible = match parent_visibility {
            QuadVisibility::PartiallyVisible => {
                self.deformation
                    .visibility(&self.frustum, self.deformed_camera, &local_box)
            }
            visibility => visibility,
        };

        // occlusion is assumed to be frame coherent, so only quads occluded
        // during the last frame are tested again
        let mut occluded = self.nodes[key].occluded;

        if visible.is_visible() && occluded {
            occluded = self.horizon.is_occluded(&local_box);

            if occluded {
                visible = QuadVisibility::Invisible;
            }
        }

        let node = &self.nodes[key];
        let (ox, oy, l, level) = (node.ox, node.oy, node.l, node.level());

        let ground = self.ground.current;
        let distance_box = LocalBox::from_quad(ox, oy, l, ground.min(0.0), ground.max(0.0));
        let dist = self
            .deformation
            .local_distance(self.local_camera, &distance_box, self.dist_factor);

        let split = (self.settings.split_invisible_quads || visible.is_visible())
            && dist < l * self.split_distance
            && level < self.settings.max_level.min(QuadCoordinate::MAX_LEVEL);

        let node = &mut self.nodes[key];
        node.visible = visible;
        node.occluded = occluded;
        node.drawable = true;

        if split {
            let children = self.subdivide(key);

            for index in self.child_order(key) {
                self.update_quad(children[index], visible);
            }

            self.nodes[key].occluded = children.iter().all(|&child| self.nodes[child].occluded);
        } else {
            if visible.is_visible() {
                let occluded = self.horizon.add_occluder(&local_box);

                let node = &mut self.nodes[key];
                node.occluded = occluded;

                if occluded {
                    node.visible = QuadVisibility::Invisible;
                }
            }

            self.merge(key);
        }
    }

    fn subdivide(&mut self, key: QuadKey) -> [QuadKey; 4] {
        if let Some(children) = self.nodes[key].children {
            return children;
        }

        let node = &self.nodes[key];
        let (coordinate, ox, oy, half) = (node.coordinate, node.ox, node.oy, 0.5 * node.l);
        let (zmin, zmax) = (node.zmin, node.zmax);

        let children = [0, 1, 2, 3].map(|index| {
            let child = QuadNode::new(
                coordinate.child(index),
                Some(key),
                ox + half * (index % 2) as f64,
                oy + half * (index / 2) as f64,
                half,
                zmin,
                zmax,
            );

            self.nodes.insert(child)
        });

        self.nodes[key].children = Some(children);

        children
    }

    fn merge(&mut self, key: QuadKey) {
        if let Some(children) = self.nodes[key].children.take() {
            for child in children {
                self.remove_subtree(child);
            }
        }
    }

    fn remove_subtree(&mut self, key: QuadKey) {
        let node = self.nodes.remove(key);

        if let Some(children) = node.children {
            for child in children {
                self.remove_subtree(child);
            }
        }
    }
}
