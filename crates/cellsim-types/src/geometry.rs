//! Axis-aligned bounds, points, and view shapes.
//!
//! The world is 3D with `x` and `y` horizontal and `z` vertical. Regions are
//! split along the longer horizontal axis, never along `z`.
//!
//! # Containment convention
//!
//! [`Bounds::contains`] is min-inclusive and max-exclusive on every axis, so
//! a point lying exactly on a split plane belongs to the high child only.
//! [`Bounds::contains_closed`] also accepts the max faces; it is used for the
//! outer world boundary so that the far edge of the world stays routable.

use core::f64::consts::TAU;
use core::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

use crate::error::GeometryError;

/// Tolerance for floating-point face and plane comparisons.
pub const EPSILON: f64 = 1e-9;

/// Number of chords used to approximate a full view circle.
const CIRCLE_SEGMENTS: u32 = 16;

/// One of the three world axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Horizontal axis.
    X,
    /// Horizontal axis.
    Y,
    /// Vertical axis.
    Z,
}

impl Axis {
    /// All axes in order.
    pub const ALL: [Self; 3] = [Self::X, Self::Y, Self::Z];

    /// The two axes other than `self`.
    pub const fn others(self) -> [Self; 2] {
        match self {
            Self::X => [Self::Y, Self::Z],
            Self::Y => [Self::X, Self::Z],
            Self::Z => [Self::X, Self::Y],
        }
    }
}

/// A point or vector in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    /// Horizontal coordinate.
    pub x: f64,
    /// Horizontal coordinate.
    pub y: f64,
    /// Vertical coordinate.
    pub z: f64,
}

impl Vec3 {
    /// The origin / zero vector.
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    /// Create a new vector.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Component along `axis`.
    pub const fn get(self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Copy of `self` with the `axis` component replaced.
    pub const fn with(mut self, axis: Axis, value: f64) -> Self {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
        self
    }

    /// Whether every component is finite.
    pub const fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Length of the horizontal (`x`, `y`) projection.
    pub fn horizontal_length(self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Euclidean distance to `other`.
    pub fn distance(self, other: Self) -> f64 {
        let d = other - self;
        d.x.hypot(d.y).hypot(d.z)
    }

    /// Component-wise minimum.
    pub fn min(self, other: Self) -> Self {
        Self::new(
            self.x.min(other.x),
            self.y.min(other.y),
            self.z.min(other.z),
        )
    }

    /// Component-wise maximum.
    pub fn max(self, other: Self) -> Self {
        Self::new(
            self.x.max(other.x),
            self.y.max(other.y),
            self.z.max(other.z),
        )
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// An axis-aligned bounding volume.
///
/// Invariant: `min <= max` on every axis and all coordinates are finite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    min: Vec3,
    max: Vec3,
}

impl Bounds {
    /// Create bounds from two corners.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::NonFinite`] for NaN/infinite coordinates and
    /// [`GeometryError::InvertedBounds`] if `min` exceeds `max` on any axis.
    pub fn new(min: Vec3, max: Vec3) -> Result<Self, GeometryError> {
        if !min.is_finite() {
            return Err(GeometryError::NonFinite(min));
        }
        if !max.is_finite() {
            return Err(GeometryError::NonFinite(max));
        }
        if Axis::ALL.iter().any(|&axis| min.get(axis) > max.get(axis)) {
            return Err(GeometryError::InvertedBounds { min, max });
        }
        Ok(Self { min, max })
    }

    /// A cube centered on `center` with the given half extent.
    ///
    /// Negative or non-finite half extents collapse to a point.
    pub fn around(center: Vec3, half_extent: f64) -> Self {
        let half = if half_extent.is_finite() {
            half_extent.max(0.0)
        } else {
            0.0
        };
        let offset = Vec3::new(half, half, half);
        Self {
            min: center - offset,
            max: center + offset,
        }
    }

    /// Minimum corner.
    pub const fn min(&self) -> Vec3 {
        self.min
    }

    /// Maximum corner.
    pub const fn max(&self) -> Vec3 {
        self.max
    }

    /// Size along `axis`.
    pub fn extent(&self, axis: Axis) -> f64 {
        self.max.get(axis) - self.min.get(axis)
    }

    /// Geometric center.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// The horizontal axis with the larger extent (`X` on ties).
    pub fn longer_horizontal_axis(&self) -> Axis {
        if self.extent(Axis::Y) > self.extent(Axis::X) {
            Axis::Y
        } else {
            Axis::X
        }
    }

    /// Half-open containment: `min <= p < max` on every axis.
    pub fn contains(&self, point: Vec3) -> bool {
        Axis::ALL.iter().all(|&axis| {
            let v = point.get(axis);
            v >= self.min.get(axis) && v < self.max.get(axis)
        })
    }

    /// Closed containment: `min <= p <= max` on every axis.
    pub fn contains_closed(&self, point: Vec3) -> bool {
        Axis::ALL.iter().all(|&axis| {
            let v = point.get(axis);
            v >= self.min.get(axis) && v <= self.max.get(axis)
        })
    }

    /// Ownership test for a region inside `world`.
    ///
    /// Half-open like [`Self::contains`], except that faces lying on the
    /// world's max faces are closed. This matches point location in the
    /// region tree.
    pub fn owns(&self, point: Vec3, world: &Self) -> bool {
        Axis::ALL.iter().all(|&axis| {
            let v = point.get(axis);
            let max = self.max.get(axis);
            let on_world_edge = (max - world.max.get(axis)).abs() <= EPSILON;
            v >= self.min.get(axis) && (v < max || (on_world_edge && v <= max))
        })
    }

    /// Whether `other` lies wholly inside `self` (closed).
    pub fn contains_bounds(&self, other: &Self) -> bool {
        Axis::ALL.iter().all(|&axis| {
            other.min.get(axis) >= self.min.get(axis) - EPSILON
                && other.max.get(axis) <= self.max.get(axis) + EPSILON
        })
    }

    /// Closed intersection test; touching faces count.
    pub fn intersects(&self, other: &Self) -> bool {
        Axis::ALL.iter().all(|&axis| {
            self.min.get(axis) <= other.max.get(axis) && other.min.get(axis) <= self.max.get(axis)
        })
    }

    /// Positive-volume overlap test; touching faces do not count.
    pub fn overlaps(&self, other: &Self) -> bool {
        Axis::ALL.iter().all(|&axis| {
            self.min.get(axis) < other.max.get(axis) && other.min.get(axis) < self.max.get(axis)
        })
    }

    /// Smallest bounds enclosing both.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Whether both corners match within [`EPSILON`].
    pub fn approx_eq(&self, other: &Self) -> bool {
        Axis::ALL.iter().all(|&axis| {
            (self.min.get(axis) - other.min.get(axis)).abs() <= EPSILON
                && (self.max.get(axis) - other.max.get(axis)).abs() <= EPSILON
        })
    }

    /// Split along `axis` at `coordinate` into (low, high) halves.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::SplitOutside`] unless the plane lies strictly
    /// inside the region on that axis.
    pub fn split_at(&self, axis: Axis, coordinate: f64) -> Result<(Self, Self), GeometryError> {
        let min = self.min.get(axis);
        let max = self.max.get(axis);
        if !coordinate.is_finite() || coordinate <= min + EPSILON || coordinate >= max - EPSILON {
            return Err(GeometryError::SplitOutside {
                axis,
                coordinate,
                min,
                max,
            });
        }
        let low = Self {
            min: self.min,
            max: self.max.with(axis, coordinate),
        };
        let high = Self {
            min: self.min.with(axis, coordinate),
            max: self.max,
        };
        Ok((low, high))
    }

    /// Split at the midpoint of the longer horizontal axis.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::SplitOutside`] if the region is too thin to
    /// split.
    pub fn split_midpoint(&self) -> Result<(Axis, Self, Self), GeometryError> {
        let axis = self.longer_horizontal_axis();
        let coordinate = self.center().get(axis);
        let (low, high) = self.split_at(axis, coordinate)?;
        Ok((axis, low, high))
    }

    /// If `low` and `high` partition `self` along one axis, return it.
    ///
    /// `low` must start at `self.min`, `high` must end at `self.max`, they
    /// must meet on exactly one plane, and match `self` on the other axes.
    pub fn partition_axis(&self, low: &Self, high: &Self) -> Option<Axis> {
        let near = |a: f64, b: f64| (a - b).abs() <= EPSILON;
        Axis::ALL.into_iter().find(|&axis| {
            let plane = low.max.get(axis);
            near(low.min.get(axis), self.min.get(axis))
                && near(high.max.get(axis), self.max.get(axis))
                && near(high.min.get(axis), plane)
                && plane > self.min.get(axis) + EPSILON
                && plane < self.max.get(axis) - EPSILON
                && axis.others().iter().all(|&other| {
                    near(low.min.get(other), self.min.get(other))
                        && near(low.max.get(other), self.max.get(other))
                        && near(high.min.get(other), self.min.get(other))
                        && near(high.max.get(other), self.max.get(other))
                })
        })
    }

    /// Whether the two volumes share part of a face with positive area.
    pub fn shares_face_with(&self, other: &Self) -> bool {
        Axis::ALL.iter().any(|&axis| {
            let touching = (self.max.get(axis) - other.min.get(axis)).abs() <= EPSILON
                || (other.max.get(axis) - self.min.get(axis)).abs() <= EPSILON;
            touching
                && axis.others().iter().all(|&o| {
                    self.min.get(o) < other.max.get(o) - EPSILON
                        && other.min.get(o) < self.max.get(o) - EPSILON
                })
        })
    }

    /// Distance from `point` to the nearest point of the volume.
    pub fn distance_to(&self, point: Vec3) -> f64 {
        let clamped = point.max(self.min).min(self.max);
        clamped.distance(point)
    }
}

/// A directional view: a horizontal circular sector extruded vertically.
///
/// The sector spans `heading ± field_of_view / 2` (radians, counter-clockwise
/// from `+x`) out to `distance`, and covers `apex.z ± distance` vertically.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewSector {
    /// Viewer position.
    pub apex: Vec3,
    /// Direction of view in the horizontal plane, radians.
    pub heading: f64,
    /// Full angular width, radians, clamped to `[0, TAU]`.
    pub field_of_view: f64,
    /// View distance.
    pub distance: f64,
}

impl ViewSector {
    /// Create a sector, clamping the angle and distance to valid ranges.
    pub fn new(apex: Vec3, heading: f64, field_of_view: f64, distance: f64) -> Self {
        Self {
            apex,
            heading: if heading.is_finite() { heading } else { 0.0 },
            field_of_view: field_of_view.clamp(0.0, TAU),
            distance: if distance.is_finite() {
                distance.max(0.0)
            } else {
                0.0
            },
        }
    }

    fn is_full_circle(&self) -> bool {
        self.field_of_view >= TAU - EPSILON
    }

    /// Horizontal outline as a convex polygon inscribed in the sector.
    ///
    /// Partial sectors include the apex; a full circle is a regular polygon
    /// around it.
    pub fn outline(&self) -> Vec<(f64, f64)> {
        let (ax, ay) = (self.apex.x, self.apex.y);
        let point = |angle: f64| {
            (
                self.distance.mul_add(angle.cos(), ax),
                self.distance.mul_add(angle.sin(), ay),
            )
        };
        if self.is_full_circle() {
            let step = TAU / f64::from(CIRCLE_SEGMENTS);
            return (0..CIRCLE_SEGMENTS)
                .map(|i| point(f64::from(i) * step))
                .collect();
        }
        let per_segment = TAU / f64::from(CIRCLE_SEGMENTS);
        let ratio = (self.field_of_view / per_segment).ceil().clamp(1.0, f64::from(CIRCLE_SEGMENTS));
        let segments = ratio_to_u32(ratio);
        let start = self.heading - self.field_of_view / 2.0;
        let step = self.field_of_view / f64::from(segments);
        let mut outline = Vec::with_capacity(usize::try_from(segments).unwrap_or(0).saturating_add(2));
        outline.push((ax, ay));
        outline.extend((0..=segments).map(|i| point(f64::from(i).mul_add(step, start))));
        outline
    }

    /// Bounding box of the sector.
    pub fn bounding_box(&self) -> Bounds {
        let outline = self.outline();
        let init = (self.apex.x, self.apex.y, self.apex.x, self.apex.y);
        let (min_x, min_y, max_x, max_y) = outline.iter().fold(init, |acc, &(x, y)| {
            (acc.0.min(x), acc.1.min(y), acc.2.max(x), acc.3.max(y))
        });
        Bounds {
            min: Vec3::new(min_x, min_y, self.apex.z - self.distance),
            max: Vec3::new(max_x, max_y, self.apex.z + self.distance),
        }
    }

    /// Whether the sector touches `bounds` (closed test).
    ///
    /// Uses the separating-axis theorem between the outline polygon and the
    /// horizontal rectangle of `bounds`, after a vertical interval check.
    pub fn intersects(&self, bounds: &Bounds) -> bool {
        let z_lo = self.apex.z - self.distance;
        let z_hi = self.apex.z + self.distance;
        if z_hi < bounds.min.z || bounds.max.z < z_lo {
            return false;
        }
        let polygon = self.outline();
        let rect = [
            (bounds.min.x, bounds.min.y),
            (bounds.max.x, bounds.min.y),
            (bounds.max.x, bounds.max.y),
            (bounds.min.x, bounds.max.y),
        ];
        let edge_normals = polygon
            .iter()
            .zip(polygon.iter().cycle().skip(1))
            .map(|(&(x0, y0), &(x1, y1))| (y0 - y1, x1 - x0))
            .filter(|&(nx, ny)| nx.hypot(ny) > EPSILON);
        let mut axes = [(1.0, 0.0), (0.0, 1.0)].into_iter().chain(edge_normals);
        !axes.any(|axis| separated_on(axis, &polygon, &rect))
    }
}

fn ratio_to_u32(ratio: f64) -> u32 {
    (1..=CIRCLE_SEGMENTS)
        .find(|&n| f64::from(n) >= ratio)
        .unwrap_or(CIRCLE_SEGMENTS)
}

fn project(axis: (f64, f64), points: &[(f64, f64)]) -> (f64, f64) {
    points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(x, y)| {
        let p = axis.0.mul_add(x, axis.1 * y);
        (lo.min(p), hi.max(p))
    })
}

fn separated_on(axis: (f64, f64), a: &[(f64, f64)], b: &[(f64, f64)]) -> bool {
    let (a_lo, a_hi) = project(axis, a);
    let (b_lo, b_hi) = project(axis, b);
    a_hi < b_lo - EPSILON || b_hi < a_lo - EPSILON
}

/// A query shape for region-intersection lookups.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    /// An axis-aligned box.
    Box(Bounds),
    /// A directional view sector.
    Sector(ViewSector),
}

impl Shape {
    /// Bounding box of the shape.
    pub fn bounding_box(&self) -> Bounds {
        match self {
            Self::Box(bounds) => *bounds,
            Self::Sector(sector) => sector.bounding_box(),
        }
    }

    /// Whether the shape touches `bounds` (closed test).
    pub fn intersects(&self, bounds: &Bounds) -> bool {
        match self {
            Self::Box(b) => b.intersects(bounds),
            Self::Sector(sector) => sector.intersects(bounds),
        }
    }
}
