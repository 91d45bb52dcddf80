use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::octree::Aabb;

/// Clip-space `w` below which a corner counts as behind the eye
const BEHIND_EYE_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone, Copy, Default)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    fn from_row(row: Vec4) -> Self {
        let normal = row.truncate();
        let length = normal.length();
        if length > 0.0 {
            Self {
                normal: normal / length,
                d: row.w / length,
            }
        } else {
            Self { normal, d: row.w }
        }
    }

    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }
}

/// View frustum as six inward-facing planes
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    pub planes: [Plane; 6], // Left, right, bottom, top, near, far
}

impl Frustum {
    /// Gribb-Hartmann extraction from a column-major view-projection matrix
    pub fn from_view_projection(view_projection: &Mat4) -> Self {
        let x = view_projection.row(0);
        let y = view_projection.row(1);
        let z = view_projection.row(2);
        let w = view_projection.row(3);
        Self {
            planes: [
                Plane::from_row(w + x),
                Plane::from_row(w - x),
                Plane::from_row(w + y),
                Plane::from_row(w - y),
                Plane::from_row(w + z),
                Plane::from_row(w - z),
            ],
        }
    }

    /// False only when the box lies entirely outside one plane
    pub fn intersects_aabb(&self, bounds: &Aabb) -> bool {
        self.planes.iter().all(|plane| {
            // Corner furthest along the plane normal
            let positive = Vec3::select(plane.normal.cmpge(Vec3::ZERO), bounds.max, bounds.min);
            plane.distance_to_point(positive) >= 0.0
        })
    }
}

/// Larger side in pixels of the screen rectangle covered by `bounds`
///
/// Infinite when any corner is behind the eye, so nodes the camera sits in
/// always refine.
pub fn projected_footprint(view_projection: &Mat4, screen_size: Vec2, bounds: &Aabb) -> f32 {
    let mut min = Vec2::splat(f32::INFINITY);
    let mut max = Vec2::splat(f32::NEG_INFINITY);
    for corner in bounds.corners() {
        let clip = *view_projection * corner.extend(1.0);
        if clip.w <= BEHIND_EYE_EPSILON {
            return f32::INFINITY;
        }
        let ndc = Vec2::new(clip.x, clip.y) / clip.w;
        min = min.min(ndc);
        max = max.max(ndc);
    }
    let extent = (max - min) * 0.5 * screen_size;
    extent.x.max(extent.y)
}
