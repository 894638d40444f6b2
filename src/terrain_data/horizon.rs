use crate::math::LocalBox;
use bevy::math::{DVec2, DVec3};

/// The number of angular bins of the horizon line.
pub const HORIZON_SIZE: usize = 256;

/// A conservative horizon line, as seen from a camera close to the terrain.
///
/// Each bin stores the lowest elevation angle (as a slope) guaranteed to be covered
/// by the occluders registered so far.
/// Occluders have to be added in front to back order, otherwise nearer boxes may be
/// culled by farther ones.
#[derive(Clone, Debug)]
pub struct HorizonBuffer {
    bins: [f64; HORIZON_SIZE],
    camera: DVec3,
    direction: DVec2,
    enabled: bool,
}

impl Default for HorizonBuffer {
    fn default() -> Self {
        Self {
            bins: [f64::NEG_INFINITY; HORIZON_SIZE],
            camera: DVec3::ZERO,
            direction: DVec2::Y,
            enabled: false,
        }
    }
}

impl HorizonBuffer {
    /// Clears the horizon for a new frame, seen from `camera` looking along `direction`.
    ///
    /// Both are in local space. The direction only uses its horizontal component.
    pub fn reset(&mut self, camera: DVec3, direction: DVec2) {
        self.bins.fill(f64::NEG_INFINITY);
        self.camera = camera;

        match direction.try_normalize() {
            Some(direction) => {
                self.direction = direction;
                self.enabled = true;
            }
            None => self.enabled = false,
        }
    }

    pub fn disable(&mut self) {
        self.bins.fill(f64::NEG_INFINITY);
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn bins(&self) -> &[f64; HORIZON_SIZE] {
        &self.bins
    }

    /// Projects the corners of the box into `(lateral, depth)` view coordinates.
    /// Returns `None` if any corner is behind the camera.
    fn project(&self, local_box: &LocalBox) -> Option<[DVec2; 4]> {
        let origin = self.camera.truncate();
        let (vx, vy) = (self.direction.x, self.direction.y);

        let corners = [
            DVec2::new(local_box.min.x, local_box.min.y),
            DVec2::new(local_box.min.x, local_box.max.y),
            DVec2::new(local_box.max.x, local_box.min.y),
            DVec2::new(local_box.max.x, local_box.max.y),
        ]
        .map(|corner| {
            let d = corner - origin;
            DVec2::new(d.y * vx - d.x * vy, d.x * vx + d.y * vy)
        });

        corners
            .iter()
            .all(|corner| corner.y > 0.0)
            .then_some(corners)
    }

    /// The range of bins covered by the lateral extent of the projected corners.
    fn lateral_range(corners: &[DVec2; 4]) -> (f64, f64) {
        let (min, max) = corners
            .iter()
            .map(|corner| corner.x / corner.y)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), x| {
                (min.min(x), max.max(x))
            });

        (min * 0.33 + 0.5, max * 0.33 + 0.5)
    }

    fn bin_range(min: f64, max: f64) -> (i64, i64) {
        let size = HORIZON_SIZE as f64;

        (
            (min * size).floor().max(0.0) as i64,
            (max * size).ceil().min(size - 1.0) as i64,
        )
    }

    fn below_horizon(&self, imin: i64, imax: i64, zmax: f64) -> bool {
        imax >= imin && (imin..=imax).all(|i| zmax <= self.bins[i as usize])
    }

    /// Tests whether the box is hidden behind the current horizon, and if not,
    /// raises the horizon by the lower bound of the box.
    pub fn add_occluder(&mut self, local_box: &LocalBox) -> bool {
        if !self.enabled {
            return false;
        }

        let Some(corners) = self.project(local_box) else {
            return false;
        };

        let (xmin, xmax) = Self::lateral_range(&corners);

        let dzmin = local_box.min.z - self.camera.z;
        let dzmax = local_box.max.z - self.camera.z;

        let zmin = corners
            .iter()
            .map(|corner| dzmin / corner.y)
            .fold(f64::INFINITY, f64::min);
        let zmax = corners
            .iter()
            .map(|corner| dzmax / corner.y)
            .fold(f64::NEG_INFINITY, f64::max);

        let (imin, imax) = Self::bin_range(xmin, xmax);

        if self.below_horizon(imin, imax, zmax) {
            return true;
        }

        // only bins completely covered by the box may be raised
        let size = HORIZON_SIZE as f64;
        let imin = (xmin * size).ceil().max(0.0) as i64;
        let imax = (xmax * size).floor().min(size - 1.0) as i64;

        for i in imin..=imax {
            let bin = &mut self.bins[i as usize];
            *bin = bin.max(zmin);
        }

        false
    }

    /// Tests whether the box is hidden behind the current horizon.
    pub fn is_occluded(&self, local_box: &LocalBox) -> bool {
        if !self.enabled {
            return false;
        }

        let Some(corners) = self.project(local_box) else {
            return false;
        };

        let (xmin, xmax) = Self::lateral_range(&corners);

        let dz = local_box.max.z - self.camera.z;
        let zmax = corners
            .iter()
            .map(|corner| dz / corner.y)
            .fold(f64::NEG_INFINITY, f64::max);

        let (imin, imax) = Self::bin_range(xmin, xmax);

        self.below_horizon(imin, imax, zmax)
    }
}
