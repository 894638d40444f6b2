//! Geometry shared by the quadtree and the deformations: local boxes, frustum planes
//! and the three-way visibility classification.

mod deformation;

pub use deformation::Deformation;

use bevy::math::{DMat4, DVec2, DVec3, DVec4};

/// The visibility of a bounding box with respect to the view frustum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum QuadVisibility {
    /// The box is completely inside the frustum.
    FullyVisible,
    /// The box intersects the frustum, or could not be classified.
    #[default]
    PartiallyVisible,
    /// The box is completely outside the frustum.
    Invisible,
}

impl QuadVisibility {
    pub fn is_visible(self) -> bool {
        self != QuadVisibility::Invisible
    }

    /// Combines the per plane results, where any rejecting plane rejects the whole box.
    pub(crate) fn combine(planes: impl IntoIterator<Item = QuadVisibility>) -> QuadVisibility {
        let mut fully = true;

        for visibility in planes {
            match visibility {
                QuadVisibility::Invisible => return QuadVisibility::Invisible,
                QuadVisibility::PartiallyVisible => fully = false,
                QuadVisibility::FullyVisible => {}
            }
        }

        if fully {
            QuadVisibility::FullyVisible
        } else {
            QuadVisibility::PartiallyVisible
        }
    }
}

/// An axis aligned box in local (flat quadtree) space.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LocalBox {
    pub min: DVec3,
    pub max: DVec3,
}

impl LocalBox {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// The box of a quad with lower left corner `(ox, oy)` and side length `l`.
    pub fn from_quad(ox: f64, oy: f64, l: f64, zmin: f64, zmax: f64) -> Self {
        Self {
            min: DVec3::new(ox, oy, zmin),
            max: DVec3::new(ox + l, oy + l, zmax),
        }
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    pub fn center(&self) -> DVec3 {
        0.5 * (self.min + self.max)
    }

    /// The four corners of the box at the given height, in the order
    /// (xmin, ymin), (xmax, ymin), (xmax, ymax), (xmin, ymax).
    pub fn corners(&self, z: f64) -> [DVec3; 4] {
        [
            DVec3::new(self.min.x, self.min.y, z),
            DVec3::new(self.max.x, self.min.y, z),
            DVec3::new(self.max.x, self.max.y, z),
            DVec3::new(self.min.x, self.max.y, z),
        ]
    }

    pub fn contains_xy(&self, point: DVec2) -> bool {
        point.x >= self.min.x && point.x <= self.max.x && point.y >= self.min.y && point.y <= self.max.y
    }
}

/// The six clip planes of a view frustum, stored as `(normal, distance)` with the
/// inside of the frustum on the positive side.
///
/// The planes are ordered left, right, bottom, top, near, far.
/// They are extracted for the reverse-z depth convention used by bevy, in which the
/// far plane of an infinite projection is degenerate and always passes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrustumPlanes(pub [DVec4; 6]);

impl FrustumPlanes {
    pub const LEFT: usize = 0;
    pub const RIGHT: usize = 1;
    pub const BOTTOM: usize = 2;
    pub const TOP: usize = 3;
    pub const NEAR: usize = 4;
    pub const FAR: usize = 5;

    pub fn from_clip_from_local(clip_from_local: DMat4) -> Self {
        let row0 = clip_from_local.row(0);
        let row1 = clip_from_local.row(1);
        let row2 = clip_from_local.row(2);
        let row3 = clip_from_local.row(3);

        Self([
            row3 + row0,
            row3 - row0,
            row3 + row1,
            row3 - row1,
            row3 - row2,
            row2,
        ])
    }

    pub fn plane(&self, index: usize) -> DVec4 {
        self.0[index]
    }

    /// The horizontal field of view in radians, derived from the left and right planes.
    pub fn fov(&self) -> f64 {
        let left = self.0[Self::LEFT].truncate().normalize_or_zero();
        let right = self.0[Self::RIGHT].truncate().normalize_or_zero();

        (-left.dot(right)).clamp(-1.0, 1.0).acos()
    }

    /// Tests an axis aligned box against all six planes.
    pub fn box_visibility(&self, local_box: &LocalBox) -> QuadVisibility {
        let points = [
            local_box.corners(local_box.min.z),
            local_box.corners(local_box.max.z),
        ]
        .concat();

        QuadVisibility::combine(self.0.iter().map(|&plane| classify(plane, &points)))
    }
}

/// Classifies a set of points against a single plane.
///
/// The points are fully accepted only if all of them are on the positive side,
/// and fully rejected only if all of them are on the negative side.
pub(crate) fn classify(plane: DVec4, points: &[DVec3]) -> QuadVisibility {
    let mut side = None;

    for point in points {
        let positive = plane.truncate().dot(*point) + plane.w > 0.0;

        match side {
            None => side = Some(positive),
            Some(previous) if previous != positive => return QuadVisibility::PartiallyVisible,
            Some(_) => {}
        }
    }

    match side {
        Some(true) => QuadVisibility::FullyVisible,
        Some(false) => QuadVisibility::Invisible,
        None => QuadVisibility::PartiallyVisible,
    }
}

/// Builds a matrix from its rows.
pub(crate) fn from_rows(r0: DVec4, r1: DVec4, r2: DVec4, r3: DVec4) -> DMat4 {
    DMat4::from_cols(r0, r1, r2, r3).transpose()
}
