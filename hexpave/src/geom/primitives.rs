//! Geometric primitives shared by the octree and the surface tools

use nalgebra::{Point3, Vector3};

/// An axis-aligned bounding box
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Point3<f64>,
    /// Maximum corner
    pub max: Point3<f64>,
}

impl Aabb {
    /// Builds a box from two corners, fixing up min/max ordering
    pub fn new(a: Point3<f64>, b: Point3<f64>) -> Self {
        Self {
            min: Point3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Point3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Builds the bounding box of a point set
    ///
    /// Returns `None` for an empty set
    pub fn around<'a, I: IntoIterator<Item = &'a Point3<f64>>>(
        pts: I,
    ) -> Option<Self> {
        let mut iter = pts.into_iter();
        let first = *iter.next()?;
        let mut out = Self {
            min: first,
            max: first,
        };
        for p in iter {
            out.extend(p);
        }
        Some(out)
    }

    /// Grows the box to include `p`
    pub fn extend(&mut self, p: &Point3<f64>) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    /// Box centre
    pub fn centre(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    /// Per-axis extent
    pub fn span(&self) -> Vector3<f64> {
        self.max - self.min
    }

    /// Returns a copy grown by `t` on every side
    pub fn inflated(&self, t: f64) -> Self {
        let d = Vector3::new(t, t, t);
        Self {
            min: self.min - d,
            max: self.max + d,
        }
    }

    /// Whether `p` lies inside or on the box
    pub fn contains(&self, p: &Point3<f64>) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    /// Whether the two boxes overlap (closed intervals)
    pub fn overlaps(&self, other: &Aabb) -> bool {
        (0..3).all(|i| self.min[i] <= other.max[i] && self.max[i] >= other.min[i])
    }

    /// Squared distance from `p` to the box (zero inside)
    pub fn dist_sq(&self, p: &Point3<f64>) -> f64 {
        let mut d = 0.0;
        for i in 0..3 {
            let v = if p[i] < self.min[i] {
                self.min[i] - p[i]
            } else if p[i] > self.max[i] {
                p[i] - self.max[i]
            } else {
                0.0
            };
            d += v * v;
        }
        d
    }
}

/// Closest point to `p` on the segment `a`-`b`
pub fn closest_on_segment(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
) -> Point3<f64> {
    let ab = b - a;
    let len_sq = ab.norm_squared();
    if len_sq <= f64::EPSILON {
        return *a;
    }
    let t = ((p - a).dot(&ab) / len_sq).clamp(0.0, 1.0);
    a + ab * t
}

/// Closest point to `p` on the triangle `(a, b, c)`
///
/// Standard region-based projection (Ericson, Real-Time Collision
/// Detection, §5.1.5).
pub fn closest_on_triangle(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
) -> Point3<f64> {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return *a;
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return *b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return *c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

/// Triangle / axis-aligned box overlap via the separating axis theorem
///
/// Conservative in the right direction for candidate lists: it may claim
/// overlap in borderline floating-point cases but never reports a false
/// negative for a genuinely intersecting pair.
pub fn triangle_overlaps_box(
    box_: &Aabb,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
) -> bool {
    let centre = box_.centre();
    let h = box_.span() * 0.5;

    let v0 = a - centre;
    let v1 = b - centre;
    let v2 = c - centre;

    // Box face normals
    for i in 0..3 {
        let lo = v0[i].min(v1[i]).min(v2[i]);
        let hi = v0[i].max(v1[i]).max(v2[i]);
        if lo > h[i] || hi < -h[i] {
            return false;
        }
    }

    // Triangle plane
    let e0 = v1 - v0;
    let e1 = v2 - v1;
    let n = e0.cross(&e1);
    let d = n.dot(&v0);
    let r = h.x * n.x.abs() + h.y * n.y.abs() + h.z * n.z.abs();
    if d.abs() > r {
        return false;
    }

    // Nine edge cross products
    let e2 = v0 - v2;
    for edge in [e0, e1, e2] {
        for axis in 0..3 {
            let mut ax = Vector3::zeros();
            ax[axis] = 1.0;
            let sep = edge.cross(&ax);
            let p0 = sep.dot(&v0);
            let p1 = sep.dot(&v1);
            let p2 = sep.dot(&v2);
            let lo = p0.min(p1).min(p2);
            let hi = p0.max(p1).max(p2);
            let r = h.x * sep.x.abs() + h.y * sep.y.abs() + h.z * sep.z.abs();
            if lo > r || hi < -r {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_box() -> Aabb {
        Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0))
    }

    #[test]
    fn box_queries() {
        let b = unit_box();
        assert!(b.contains(&Point3::new(0.5, 0.5, 0.5)));
        assert!(b.contains(&Point3::new(1.0, 1.0, 1.0)));
        assert!(!b.contains(&Point3::new(1.0, 1.0, 1.1)));
        assert_relative_eq!(b.dist_sq(&Point3::new(2.0, 0.5, 0.5)), 1.0);

        let c = Aabb::new(Point3::new(0.9, 0.9, 0.9), Point3::new(2.0, 2.0, 2.0));
        assert!(b.overlaps(&c));
        let d = Aabb::new(Point3::new(1.1, 0.0, 0.0), Point3::new(2.0, 1.0, 1.0));
        assert!(!b.overlaps(&d));
    }

    #[test]
    fn triangle_projection_regions() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(0.0, 1.0, 0.0);

        // Interior
        let q = closest_on_triangle(&Point3::new(0.2, 0.2, 1.0), &a, &b, &c);
        assert_relative_eq!(q, Point3::new(0.2, 0.2, 0.0));
        // Vertex region
        let q = closest_on_triangle(&Point3::new(-1.0, -1.0, 0.0), &a, &b, &c);
        assert_relative_eq!(q, a);
        // Edge region
        let q = closest_on_triangle(&Point3::new(0.5, -1.0, 0.0), &a, &b, &c);
        assert_relative_eq!(q, Point3::new(0.5, 0.0, 0.0));
    }

    #[test]
    fn triangle_box_overlap() {
        let b = unit_box();
        // Fully inside
        assert!(triangle_overlaps_box(
            &b,
            &Point3::new(0.2, 0.2, 0.2),
            &Point3::new(0.8, 0.2, 0.2),
            &Point3::new(0.2, 0.8, 0.2),
        ));
        // Plane cuts through the box, vertices outside
        assert!(triangle_overlaps_box(
            &b,
            &Point3::new(-1.0, 0.5, 0.5),
            &Point3::new(2.0, 0.5, 0.5),
            &Point3::new(0.5, 2.0, 0.5),
        ));
        // Clearly separated
        assert!(!triangle_overlaps_box(
            &b,
            &Point3::new(2.0, 2.0, 2.0),
            &Point3::new(3.0, 2.0, 2.0),
            &Point3::new(2.0, 3.0, 2.0),
        ));
    }
}
