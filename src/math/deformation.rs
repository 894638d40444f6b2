use crate::math::{classify, from_rows, FrustumPlanes, LocalBox, QuadVisibility};
use bevy::math::{DMat4, DVec2, DVec3, DVec4};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};

/// Maps positions between the flat local space of the quadtree and the deformed
/// space in which the terrain is rendered.
///
/// Local space is spanned by the quadtree in x and y, with z as the height above the
/// reference surface.
/// The deformed space of the curved variants is centered on the axis (cylinder) or
/// the center (sphere) of the reference surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Deformation {
    /// Flat terrain, local and deformed space coincide.
    #[default]
    Identity,
    /// Terrain on the inside of a cylinder around the x axis.
    Cylinder { radius: f64 },
    /// Terrain on the +z face of a sphere centered at the origin.
    Sphere { radius: f64 },
}

impl Deformation {
    pub fn radius(&self) -> f64 {
        match *self {
            Deformation::Identity => 0.0,
            Deformation::Cylinder { radius } | Deformation::Sphere { radius } => radius,
        }
    }

    pub fn is_curved(&self) -> bool {
        !matches!(self, Deformation::Identity)
    }

    pub fn to_deformed(&self, local: DVec3) -> DVec3 {
        match *self {
            Deformation::Identity => local,
            Deformation::Cylinder { radius } => {
                let alpha = local.y / radius;
                let r = radius - local.z;

                DVec3::new(local.x, r * alpha.sin(), -r * alpha.cos())
            }
            Deformation::Sphere { radius } => {
                DVec3::new(local.x, local.y, radius).normalize() * (local.z + radius)
            }
        }
    }

    /// The inverse of [`Self::to_deformed`].
    ///
    /// Points on the singular back side of the curved variants map to infinity.
    pub fn to_local(&self, deformed: DVec3) -> DVec3 {
        match *self {
            Deformation::Identity => deformed,
            Deformation::Cylinder { radius } => {
                let r = (deformed.y * deformed.y + deformed.z * deformed.z).sqrt();

                if r == 0.0 {
                    return DVec3::INFINITY;
                }

                let alpha = deformed.y.atan2(-deformed.z);

                DVec3::new(deformed.x, alpha * radius, radius - r)
            }
            Deformation::Sphere { radius } => sphere_to_local(radius, deformed),
        }
    }

    /// The first order approximation of [`Self::to_deformed`] around `local`, evaluated
    /// on the reference surface.
    ///
    /// With `clamp`, the x and y coordinates are first wrapped into a single period,
    /// which keeps the approximation valid for cameras far outside the root quad.
    pub fn differential(&self, local: DVec3, clamp: bool) -> DMat4 {
        if !local.is_finite() {
            return DMat4::IDENTITY;
        }

        match *self {
            Deformation::Identity => {
                DMat4::from_translation(DVec3::new(local.x, local.y, 0.0))
            }
            Deformation::Cylinder { radius } => {
                let (sin, cos) = (local.y / radius).sin_cos();

                from_rows(
                    DVec4::new(1.0, 0.0, 0.0, local.x),
                    DVec4::new(0.0, cos, -sin, radius * sin),
                    DVec4::new(0.0, sin, cos, -radius * cos),
                    DVec4::W,
                )
            }
            Deformation::Sphere { radius } => {
                let mut point = local;

                if clamp {
                    let period = 2.0 * radius;
                    point.x -= ((point.x + radius) / period).floor() * period;
                    point.y -= ((point.y + radius) / period).floor() * period;
                }

                let (x, y, r) = (point.x, point.y, radius);
                let l = x * x + y * y + r * r;
                let c0 = 1.0 / l.sqrt();
                let c1 = c0 * r / l;

                from_rows(
                    DVec4::new((y * y + r * r) * c1, -x * y * c1, x * c0, r * x * c0),
                    DVec4::new(-x * y * c1, (x * x + r * r) * c1, y * c0, r * y * c0),
                    DVec4::new(-x * r * c1, -y * r * c1, r * c0, r * r * c0),
                    DVec4::W,
                )
            }
        }
    }

    /// A frame whose xy plane is tangent to the deformed reference surface at `deformed`.
    ///
    /// The result maps deformed positions into that frame. It is not the inverse of
    /// [`Self::differential`].
    pub fn tangent_frame(&self, deformed: DVec3) -> DMat4 {
        match *self {
            Deformation::Identity => {
                DMat4::from_translation(DVec3::new(-deformed.x, -deformed.y, 0.0))
            }
            Deformation::Cylinder { radius } => {
                let uz = DVec3::new(0.0, -deformed.y, -deformed.z).normalize_or_zero();
                let ux = DVec3::X;
                let uy = uz.cross(ux);
                let origin = DVec3::new(deformed.x, -uz.y * radius, -uz.z * radius);

                from_rows(
                    ux.extend(-ux.dot(origin)),
                    uy.extend(-uy.dot(origin)),
                    uz.extend(-uz.dot(origin)),
                    DVec4::W,
                )
            }
            Deformation::Sphere { radius } => {
                let uz = deformed.normalize_or_zero();
                let ux = DVec3::Y.cross(uz).try_normalize().unwrap_or(DVec3::X);
                let uy = uz.cross(ux);

                from_rows(ux.extend(0.0), uy.extend(0.0), uz.extend(-radius), DVec4::W)
            }
        }
    }

    /// Classifies a local box against the deformed frustum planes.
    ///
    /// The deformed image of a flat box is not flat, so the curved variants enlarge
    /// the tested corners by a conservative factor and only reject or accept a plane
    /// if both the original and the enlarged corners agree.
    pub fn visibility(
        &self,
        planes: &FrustumPlanes,
        deformed_camera: DVec3,
        local_box: &LocalBox,
    ) -> QuadVisibility {
        match *self {
            Deformation::Identity => planes.box_visibility(local_box),
            Deformation::Cylinder { radius } => {
                cylinder_visibility(self, radius, planes, local_box)
            }
            Deformation::Sphere { radius } => {
                sphere_visibility(self, radius, planes, deformed_camera, local_box)
            }
        }
    }

    /// Local xy bounds of the deformed disk with the given center and radius.
    ///
    /// Returns `None` if the center maps to the singular point of the deformation.
    pub fn deformed_to_local_bounds(&self, center: DVec3, radius: f64) -> Option<(DVec2, DVec2)> {
        let p = self.to_local(center);

        if !p.is_finite() {
            return None;
        }

        match *self {
            Deformation::Identity => Some((
                DVec2::new(p.x - radius, p.y - radius),
                DVec2::new(p.x + radius, p.y + radius),
            )),
            Deformation::Cylinder { radius: r } => {
                let distance = r - p.z;

                let half_y = if distance > 0.0 && radius < distance {
                    (radius / distance).asin() * r
                } else {
                    PI * r
                };

                Some((
                    DVec2::new(p.x - radius, p.y - half_y),
                    DVec2::new(p.x + radius, p.y + half_y),
                ))
            }
            Deformation::Sphere { radius: r } => sphere_local_bounds(r, p, radius),
        }
    }

    /// The distance between a local position and a local box used to drive subdivision.
    ///
    /// The vertical distance to the bottom of the box is divided by `dist_factor`,
    /// the horizontal distances are the smaller distances to the box edges per axis.
    pub fn local_distance(&self, local: DVec3, local_box: &LocalBox, dist_factor: f64) -> f64 {
        let dz = (local.z - local_box.min.z).abs() / dist_factor;
        let dx = (local.x - local_box.min.x)
            .abs()
            .min((local.x - local_box.max.x).abs());
        let dy = (local.y - local_box.min.y)
            .abs()
            .min((local.y - local_box.max.y).abs());

        dz.max(dx).max(dy)
    }
}

fn sphere_to_local(radius: f64, p: DVec3) -> DVec3 {
    let l = p.length();

    if l == 0.0 {
        return DVec3::new(0.0, 0.0, -radius);
    }

    let (ax, ay) = (p.x.abs(), p.y.abs());
    let az = p.z.abs();

    if p.z >= ax && p.z >= ay {
        DVec3::new(p.x / p.z * radius, p.y / p.z * radius, l - radius)
    } else if p.z <= -ax && p.z <= -ay {
        DVec3::INFINITY
    } else if p.y >= ax && p.y >= az {
        let v = 2.0 * radius - radius * p.z / p.y;
        DVec3::new(p.x / p.y * v, v, l - radius)
    } else if p.y <= -ax && p.y <= -az {
        let v = 2.0 * radius + radius * p.z / p.y;
        DVec3::new(-p.x / p.y * v, -v, l - radius)
    } else if p.x >= ay && p.x >= az {
        let v = 2.0 * radius - radius * p.z / p.x;
        DVec3::new(v, p.y / p.x * v, l - radius)
    } else {
        let v = 2.0 * radius + radius * p.z / p.x;
        DVec3::new(-v, -p.y / p.x * v, l - radius)
    }
}

/// Classifies corner points and their enlarged counterparts against a plane.
fn scaled_visibility(plane: DVec4, corners: &[DVec3; 4], scale: impl Fn(DVec3) -> DVec3) -> QuadVisibility {
    let points: [DVec3; 8] = [
        corners[0],
        corners[1],
        corners[2],
        corners[3],
        scale(corners[0]),
        scale(corners[1]),
        scale(corners[2]),
        scale(corners[3]),
    ];

    classify(plane, &points)
}

fn cylinder_visibility(
    deformation: &Deformation,
    radius: f64,
    planes: &FrustumPlanes,
    local_box: &LocalBox,
) -> QuadVisibility {
    let half_angle = (local_box.max.y - local_box.min.y) / (2.0 * radius);

    if radius - local_box.max.z <= 0.0 || half_angle >= FRAC_PI_2 {
        return QuadVisibility::PartiallyVisible;
    }

    let corners = local_box
        .corners(local_box.max.z)
        .map(|corner| deformation.to_deformed(corner));

    let f = (radius - local_box.min.z) / ((radius - local_box.max.z) * half_angle.cos());

    QuadVisibility::combine(planes.0.iter().map(|&plane| {
        scaled_visibility(plane, &corners, |p| DVec3::new(p.x, f * p.y, f * p.z))
    }))
}

fn sphere_visibility(
    deformation: &Deformation,
    radius: f64,
    planes: &FrustumPlanes,
    deformed_camera: DVec3,
    local_box: &LocalBox,
) -> QuadVisibility {
    let corners = local_box
        .corners(local_box.min.z)
        .map(|corner| deformation.to_deformed(corner));

    let a = (local_box.max.z + radius) / (local_box.min.z + radius);
    let dx = (local_box.max.x - local_box.min.x) / 2.0 * a;
    let dy = (local_box.max.y - local_box.min.y) / 2.0 * a;
    let dz = local_box.max.z + radius;
    let f = (dx * dx + dy * dy + dz * dz).sqrt() / (local_box.min.z + radius);

    let frustum = planes.0[..FrustumPlanes::FAR]
        .iter()
        .map(|&plane| scaled_visibility(plane, &corners, |p| p * f));

    let visibility = QuadVisibility::combine(frustum);

    if visibility == QuadVisibility::Invisible {
        return visibility;
    }

    // Plane through the horizon of the lowest possible surface as seen from the camera.
    let l2 = deformed_camera.length_squared();
    let rm = radius + local_box.min.z.min(0.0);
    let rm2 = rm * rm;
    let rmax = radius + local_box.max.z;

    if l2 <= rm2 {
        return visibility;
    }

    let horizon = deformed_camera.extend(((l2 - rm2) * (rmax * rmax - rm2)).sqrt() - rm2);

    QuadVisibility::combine([
        visibility,
        scaled_visibility(horizon, &corners, |p| p * f),
    ])
}

fn sphere_local_bounds(radius: f64, p: DVec3, disk_radius: f64) -> Option<(DVec2, DVec2)> {
    let r2 = radius * radius;
    let k = (1.0 - disk_radius * disk_radius / (2.0 * r2)) * DVec3::new(p.x, p.y, radius).length();
    let k2 = k * k;

    let a_ = k2 - p.x * p.x;
    let b_ = k2 - p.y * p.y;
    let c_ = -2.0 * p.x * p.y;
    let d_ = -2.0 * r2 * p.x;
    let e_ = -2.0 * r2 * p.y;
    let f_ = r2 * (k2 - r2);

    let a = c_ * c_ - 4.0 * a_ * b_;

    let b = 2.0 * c_ * e_ - 4.0 * b_ * d_;
    let c = e_ * e_ - 4.0 * b_ * f_;
    let d = (b * b - 4.0 * a * c).sqrt();
    let (x1, x2) = ((-b - d) / (2.0 * a), (-b + d) / (2.0 * a));

    let b = 2.0 * c_ * d_ - 4.0 * a_ * e_;
    let c = d_ * d_ - 4.0 * a_ * f_;
    let d = (b * b - 4.0 * a * c).sqrt();
    let (y1, y2) = ((-b - d) / (2.0 * a), (-b + d) / (2.0 * a));

    let min = DVec2::new(x1.min(x2), y1.min(y2));
    let max = DVec2::new(x1.max(x2), y1.max(y2));

    (min.is_finite() && max.is_finite()).then_some((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::tests::clip_from_local;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const RADIUS: f64 = 1000.0;

    fn assert_close(a: DVec3, b: DVec3, epsilon: f64) {
        assert!(
            (a - b).abs().max_element() < epsilon,
            "{a} and {b} differ by more than {epsilon}"
        );
    }

    #[test]
    fn round_trip() {
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..1000 {
            let local = DVec3::new(
                rng.random_range(-RADIUS..RADIUS),
                rng.random_range(-RADIUS..RADIUS),
                rng.random_range(-0.5 * RADIUS..0.5 * RADIUS),
            );

            let identity = Deformation::Identity;
            assert_close(identity.to_local(identity.to_deformed(local)), local, 1e-12);

            let sphere = Deformation::Sphere { radius: RADIUS };
            assert_close(sphere.to_local(sphere.to_deformed(local)), local, 1e-6);

            let cylinder = Deformation::Cylinder { radius: RADIUS };
            let local = DVec3::new(local.x, local.y * 0.9 * PI, local.z);
            assert_close(cylinder.to_local(cylinder.to_deformed(local)), local, 1e-6);
        }
    }

    #[test]
    fn singular_points() {
        let cylinder = Deformation::Cylinder { radius: RADIUS };
        assert_eq!(cylinder.to_local(DVec3::new(5.0, 0.0, 0.0)), DVec3::INFINITY);

        let sphere = Deformation::Sphere { radius: RADIUS };
        assert_eq!(sphere.to_local(DVec3::new(0.0, 0.0, -RADIUS)), DVec3::INFINITY);
        assert_eq!(sphere.to_local(DVec3::ZERO), DVec3::new(0.0, 0.0, -RADIUS));
    }

    #[test]
    fn sphere_faces_are_selected_in_order() {
        let sphere = Deformation::Sphere { radius: RADIUS };

        // z and y tie, z wins
        let local = sphere.to_local(DVec3::new(0.0, 1.0, 1.0));
        assert_close(local, DVec3::new(0.0, RADIUS, 2f64.sqrt() - RADIUS), 1e-9);

        // y and x tie, y wins
        let local = sphere.to_local(DVec3::new(1.0, 1.0, 0.0));
        assert_close(local, DVec3::new(2.0 * RADIUS, 2.0 * RADIUS, 2f64.sqrt() - RADIUS), 1e-9);

        let local = sphere.to_local(DVec3::new(-1.0, 0.0, 0.0));
        assert_close(local, DVec3::new(-2.0 * RADIUS, 0.0, 1.0 - RADIUS), 1e-9);
    }

    #[test]
    fn differential_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(7);
        let h = 1e-4;

        for deformation in [
            Deformation::Identity,
            Deformation::Cylinder { radius: RADIUS },
            Deformation::Sphere { radius: RADIUS },
        ] {
            for _ in 0..100 {
                let local = DVec3::new(
                    rng.random_range(-0.9 * RADIUS..0.9 * RADIUS),
                    rng.random_range(-0.9 * RADIUS..0.9 * RADIUS),
                    0.0,
                );

                let differential = deformation.differential(local, false);
                let origin = deformation.to_deformed(local);

                assert_close(differential.w_axis.truncate(), origin, 1e-6);

                for (axis, column) in [
                    (DVec3::X, differential.x_axis),
                    (DVec3::Y, differential.y_axis),
                    (DVec3::Z, differential.z_axis),
                ] {
                    let forward = deformation.to_deformed(local + h * axis);
                    let backward = deformation.to_deformed(local - h * axis);
                    let derivative = (forward - backward) / (2.0 * h);

                    assert_close(derivative, column.truncate(), 1e-5);
                }
            }
        }
    }

    #[test]
    fn clamped_differential_wraps_periodically() {
        let sphere = Deformation::Sphere { radius: RADIUS };

        let inside = sphere.differential(DVec3::new(100.0, -200.0, 0.0), true);
        let wrapped = sphere.differential(DVec3::new(100.0 + 2.0 * RADIUS, -200.0 - 4.0 * RADIUS, 0.0), true);

        assert!(inside.abs_diff_eq(wrapped, 1e-9));
    }

    #[test]
    fn tangent_frame_maps_surface_point_to_origin() {
        for deformation in [
            Deformation::Cylinder { radius: RADIUS },
            Deformation::Sphere { radius: RADIUS },
        ] {
            let deformed = deformation.to_deformed(DVec3::new(120.0, -340.0, 0.0));
            let frame = deformation.tangent_frame(deformed);

            let origin = frame.transform_point3(deformed);
            assert_close(origin, DVec3::ZERO, 1e-6);

            // the normal of the reference surface is the z axis of the frame
            let normal = match deformation {
                Deformation::Cylinder { .. } => DVec3::new(0.0, -deformed.y, -deformed.z).normalize(),
                _ => deformed.normalize(),
            };
            assert_close(frame.transform_vector3(normal), DVec3::Z, 1e-9);
        }
    }

    #[test]
    fn sphere_visibility() {
        let sphere = Deformation::Sphere { radius: RADIUS };

        let camera = DVec3::new(0.0, 0.0, 1100.0);
        let planes = FrustumPlanes::from_clip_from_local(clip_from_local(camera, DVec3::ZERO, DVec3::Y));

        let below = LocalBox::new(DVec3::new(-10.0, -10.0, 0.0), DVec3::new(10.0, 10.0, 10.0));
        assert_eq!(
            sphere.visibility(&planes, camera, &below),
            QuadVisibility::FullyVisible
        );

        // beyond the horizon of a camera close to the surface
        let camera = DVec3::new(0.0, 0.0, 1001.0);
        let planes = FrustumPlanes::from_clip_from_local(clip_from_local(
            camera,
            DVec3::new(700.0, 0.0, 700.0),
            DVec3::Y,
        ));

        let hidden = LocalBox::new(DVec3::new(900.0, -50.0, 0.0), DVec3::new(1000.0, 50.0, 0.0));
        assert_eq!(
            sphere.visibility(&planes, camera, &hidden),
            QuadVisibility::Invisible
        );
    }

    #[test]
    fn cylinder_visibility() {
        let cylinder = Deformation::Cylinder { radius: RADIUS };

        let camera = DVec3::new(0.0, 0.0, -900.0);
        let planes = FrustumPlanes::from_clip_from_local(clip_from_local(
            camera,
            DVec3::new(100.0, 0.0, -900.0),
            DVec3::Z,
        ));

        let ahead = LocalBox::new(DVec3::new(400.0, -20.0, 0.0), DVec3::new(500.0, 20.0, 10.0));
        let behind = LocalBox::new(DVec3::new(-150.0, -20.0, 0.0), DVec3::new(-50.0, 20.0, 10.0));
        let below = LocalBox::new(DVec3::new(50.0, -20.0, 0.0), DVec3::new(150.0, 20.0, 10.0));

        assert_eq!(
            cylinder.visibility(&planes, camera, &ahead),
            QuadVisibility::FullyVisible
        );
        assert_eq!(
            cylinder.visibility(&planes, camera, &behind),
            QuadVisibility::Invisible
        );
        assert_eq!(
            cylinder.visibility(&planes, camera, &below),
            QuadVisibility::PartiallyVisible
        );

        let wrapping = LocalBox::new(DVec3::new(400.0, -2000.0, 0.0), DVec3::new(500.0, 2000.0, 10.0));
        assert_eq!(
            cylinder.visibility(&planes, camera, &wrapping),
            QuadVisibility::PartiallyVisible
        );
    }

    #[test]
    fn local_bounds_contain_center() {
        let identity = Deformation::Identity;
        let (min, max) = identity
            .deformed_to_local_bounds(DVec3::new(1.0, 2.0, 3.0), 0.5)
            .unwrap();
        assert_eq!((min, max), (DVec2::new(0.5, 1.5), DVec2::new(1.5, 2.5)));

        let sphere = Deformation::Sphere { radius: RADIUS };
        let (min, max) = sphere
            .deformed_to_local_bounds(DVec3::new(0.0, 0.0, RADIUS), 10.0)
            .unwrap();
        assert!((max.x - min.x - 20.0).abs() < 0.2);
        assert!((max.y - min.y - 20.0).abs() < 0.2);
        assert!(min.x < 0.0 && max.x > 0.0 && min.y < 0.0 && max.y > 0.0);

        let cylinder = Deformation::Cylinder { radius: RADIUS };
        let (min, max) = cylinder
            .deformed_to_local_bounds(cylinder.to_deformed(DVec3::new(5.0, 30.0, 0.0)), 10.0)
            .unwrap();
        assert!((min.x + 5.0).abs() < 1e-9 && (max.x - 15.0).abs() < 1e-9);
        assert!((max.y - 30.0 - (0.01f64).asin() * RADIUS).abs() < 1e-6);

        let (min, max) = cylinder
            .deformed_to_local_bounds(DVec3::new(0.0, 0.0, -10.0), 20.0)
            .unwrap();
        assert_eq!((min.y, max.y), (-PI * RADIUS, PI * RADIUS));

        assert!(cylinder.deformed_to_local_bounds(DVec3::X, 1.0).is_none());
    }

    #[test]
    fn local_distance_is_chebyshev() {
        let local_box = LocalBox::new(DVec3::new(0.0, 0.0, -5.0), DVec3::new(10.0, 10.0, 5.0));
        let deformation = Deformation::Identity;

        assert_eq!(
            deformation.local_distance(DVec3::new(2.0, 3.0, 5.0), &local_box, 1.0),
            10.0
        );
        assert_eq!(
            deformation.local_distance(DVec3::new(2.0, 3.0, 5.0), &local_box, 5.0),
            3.0
        );
    }
}
