//! Binary space-partition tree over [`RegionId`]s.
//!
//! Every node covers an axis-aligned [`Bounds`]. An internal node is split
//! by a single plane into a low and a high child; leaves carry no split and
//! are the regions owned by cell controllers.
//!
//! Point location descends by comparing the point against each split plane:
//! strictly below goes low, on or above goes high. The root itself is
//! closed on its max faces so the far edge of the world is routable.

use std::collections::{BTreeMap, BTreeSet};

use cellsim_types::{Axis, Bounds, HostId, RegionId, Shape, Side, Vec3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{InvariantViolation, RoutingError, StructuralError};

/// The plane dividing an internal node into two children.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitPlane {
    /// Axis the plane is perpendicular to.
    pub axis: Axis,
    /// Position of the plane along `axis`.
    pub coordinate: f64,
    /// Child below the plane.
    pub low: RegionId,
    /// Child on or above the plane.
    pub high: RegionId,
}

impl SplitPlane {
    /// The child a point falls into.
    pub fn child_for(&self, point: Vec3) -> RegionId {
        if point.get(self.axis) < self.coordinate {
            self.low
        } else {
            self.high
        }
    }

    /// Both children, low first.
    pub const fn children(&self) -> [RegionId; 2] {
        [self.low, self.high]
    }
}

/// One node of the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexNode {
    /// Node identifier.
    pub id: RegionId,
    /// Volume the node covers.
    pub bounds: Bounds,
    /// The dividing plane; `None` for leaves.
    pub split: Option<SplitPlane>,
    /// Host process that owns the region.
    pub owner: HostId,
}

impl IndexNode {
    fn leaf(id: RegionId, bounds: Bounds, owner: HostId) -> Self {
        Self {
            id,
            bounds,
            split: None,
            owner,
        }
    }

    /// Whether the node has no children.
    pub const fn is_leaf(&self) -> bool {
        self.split.is_none()
    }
}

/// The region tree.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    nodes: BTreeMap<RegionId, IndexNode>,
}

impl SpatialIndex {
    /// Create an index holding a single root leaf.
    pub fn new(root_bounds: Bounds, owner: HostId) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            RegionId::ROOT,
            IndexNode::leaf(RegionId::ROOT, root_bounds, owner),
        );
        Self { nodes }
    }

    /// The root region id.
    pub const fn root(&self) -> RegionId {
        RegionId::ROOT
    }

    /// Bounds of the whole world.
    pub fn world_bounds(&self) -> Option<Bounds> {
        self.bounds(RegionId::ROOT)
    }

    /// Look up a node.
    pub fn node(&self, id: RegionId) -> Option<&IndexNode> {
        self.nodes.get(&id)
    }

    /// Whether `id` is a node of the tree.
    pub fn contains(&self, id: RegionId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Bounds of a node.
    pub fn bounds(&self, id: RegionId) -> Option<Bounds> {
        self.nodes.get(&id).map(|n| n.bounds)
    }

    /// Owning host of a node.
    pub fn owner(&self, id: RegionId) -> Option<HostId> {
        self.nodes.get(&id).map(|n| n.owner)
    }

    /// Whether `id` is a leaf. Unknown ids are not leaves.
    pub fn is_leaf(&self, id: RegionId) -> bool {
        self.nodes.get(&id).is_some_and(IndexNode::is_leaf)
    }

    /// All leaves in id order.
    pub fn leaves(&self) -> Vec<RegionId> {
        self.nodes
            .values()
            .filter(|n| n.is_leaf())
            .map(|n| n.id)
            .collect()
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_leaf()).count()
    }

    /// Depth of the deepest leaf.
    pub fn depth(&self) -> u8 {
        self.nodes.keys().map(|id| id.depth()).max().unwrap_or(0)
    }

    /// The sibling of `id`, if `id` is a non-root node of the tree.
    pub fn sibling_of(&self, id: RegionId) -> Option<RegionId> {
        if !self.contains(id) {
            return None;
        }
        id.sibling().filter(|s| self.contains(*s))
    }

    /// Find the leaf that owns `point`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::OutsideWorld`] if the point is not finite or
    /// lies outside the root region.
    pub fn locate(&self, point: Vec3) -> Result<RegionId, RoutingError> {
        let root = self
            .nodes
            .get(&RegionId::ROOT)
            .ok_or(RoutingError::OutsideWorld(point))?;
        if !point.is_finite() || !root.bounds.contains_closed(point) {
            return Err(RoutingError::OutsideWorld(point));
        }
        let mut current = root;
        while let Some(plane) = current.split {
            current = self
                .nodes
                .get(&plane.child_for(point))
                .ok_or(RoutingError::OutsideWorld(point))?;
        }
        Ok(current.id)
    }

    /// Split leaf `id` into two children covering `a` and `b`.
    ///
    /// The two volumes must partition the leaf along exactly one axis; they
    /// may be given in either order. Returns the new children, low first.
    ///
    /// # Errors
    ///
    /// Returns [`StructuralError::UnknownRegion`], [`StructuralError::SplitNonLeaf`],
    /// [`StructuralError::InvalidPartition`], or
    /// [`StructuralError::DepthExhausted`].
    pub fn split(
        &mut self,
        id: RegionId,
        a: Bounds,
        b: Bounds,
        owner: HostId,
    ) -> Result<[RegionId; 2], StructuralError> {
        let node = self
            .nodes
            .get(&id)
            .ok_or(StructuralError::UnknownRegion(id))?;
        if !node.is_leaf() {
            return Err(StructuralError::SplitNonLeaf(id));
        }
        let (axis, low_bounds, high_bounds) =
            if let Some(axis) = node.bounds.partition_axis(&a, &b) {
                (axis, a, b)
            } else if let Some(axis) = node.bounds.partition_axis(&b, &a) {
                (axis, b, a)
            } else {
                return Err(StructuralError::InvalidPartition(id));
            };
        let [low, high] = id.children().ok_or(StructuralError::DepthExhausted(id))?;
        let plane = SplitPlane {
            axis,
            coordinate: low_bounds.max().get(axis),
            low,
            high,
        };

        self.nodes
            .insert(low, IndexNode::leaf(low, low_bounds, owner));
        self.nodes
            .insert(high, IndexNode::leaf(high, high_bounds, owner));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.split = Some(plane);
        }
        debug!(region = %id, ?axis, coordinate = plane.coordinate, "Region split");
        Ok([low, high])
    }

    /// Merge leaf `id` and its sibling back into their parent.
    ///
    /// Returns the parent, which is a leaf afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`StructuralError::UnknownRegion`], [`StructuralError::MergeOnRoot`],
    /// [`StructuralError::MergeNonLeaf`], or [`StructuralError::SiblingNotLeaf`].
    pub fn merge(&mut self, id: RegionId) -> Result<RegionId, StructuralError> {
        let node = self
            .nodes
            .get(&id)
            .ok_or(StructuralError::UnknownRegion(id))?;
        let (Some(parent), Some(sibling)) = (id.parent(), id.sibling()) else {
            return Err(StructuralError::MergeOnRoot);
        };
        if !node.is_leaf() {
            return Err(StructuralError::MergeNonLeaf(id));
        }
        if !self.is_leaf(sibling) {
            return Err(StructuralError::SiblingNotLeaf {
                region: id,
                sibling,
            });
        }
        self.nodes.remove(&id);
        self.nodes.remove(&sibling);
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.split = None;
        }
        debug!(region = %parent, "Regions merged");
        Ok(parent)
    }

    /// Remove every descendant of `id`, making it a leaf again.
    ///
    /// Returns the removed leaves.
    ///
    /// # Errors
    ///
    /// Returns [`StructuralError::UnknownRegion`] or
    /// [`StructuralError::MergeOnRoot`].
    pub fn merge_subtree(&mut self, id: RegionId) -> Result<Vec<RegionId>, StructuralError> {
        if !self.contains(id) {
            return Err(StructuralError::UnknownRegion(id));
        }
        if id.is_root() {
            return Err(StructuralError::MergeOnRoot);
        }
        let descendants: Vec<RegionId> = self
            .nodes
            .keys()
            .copied()
            .filter(|n| id.is_ancestor_of(*n))
            .collect();
        let mut removed_leaves = Vec::new();
        for descendant in descendants {
            if let Some(node) = self.nodes.remove(&descendant)
                && node.is_leaf()
            {
                removed_leaves.push(descendant);
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.split = None;
        }
        debug!(region = %id, removed = removed_leaves.len(), "Subtree collapsed");
        Ok(removed_leaves)
    }

    /// Leaves whose bounds intersect `shape`.
    ///
    /// Starting at `start`, walks up to the nearest ancestor whose bounds
    /// contain the shape's bounding box (or the root), then walks down
    /// collecting intersecting leaves. An unknown `start` begins at the root.
    pub fn regions_intersecting(&self, start: RegionId, shape: &Shape) -> BTreeSet<RegionId> {
        let bbox = shape.bounding_box();
        let mut anchor = if self.contains(start) {
            start
        } else {
            RegionId::ROOT
        };
        while let Some(node) = self.nodes.get(&anchor) {
            if node.bounds.contains_bounds(&bbox) {
                break;
            }
            match anchor.parent() {
                Some(parent) => anchor = parent,
                None => break,
            }
        }

        let mut found = BTreeSet::new();
        let mut stack = vec![anchor];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if !shape.intersects(&node.bounds) {
                continue;
            }
            match node.split {
                Some(plane) => stack.extend(plane.children()),
                None => {
                    found.insert(id);
                }
            }
        }
        found
    }

    /// Leaves sharing a face with `id` (not including `id`).
    pub fn neighbors(&self, id: RegionId) -> Vec<RegionId> {
        let Some(target) = self.bounds(id) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        let mut stack = vec![RegionId::ROOT];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            if current == id || !node.bounds.intersects(&target) {
                continue;
            }
            match node.split {
                Some(plane) => stack.extend(plane.children()),
                None if node.bounds.shares_face_with(&target) => found.push(current),
                None => {}
            }
        }
        found.sort();
        found
    }

    /// Verify the structural invariants of the tree.
    ///
    /// # Errors
    ///
    /// Returns the first [`InvariantViolation`] found.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if !self.nodes.contains_key(&RegionId::ROOT) {
            return Err(InvariantViolation::new(RegionId::ROOT, "missing root"));
        }

        for node in self.nodes.values() {
            if node.id.is_root() {
                continue;
            }
            let parent_id = node
                .id
                .parent()
                .ok_or_else(|| InvariantViolation::new(node.id, "non-root without parent"))?;
            let parent = self
                .nodes
                .get(&parent_id)
                .ok_or_else(|| InvariantViolation::new(node.id, "orphaned node"))?;
            if !parent.split.is_some_and(|p| p.children().contains(&node.id)) {
                return Err(InvariantViolation::new(
                    node.id,
                    format!("parent {parent_id} does not list this node as a child"),
                ));
            }
            if !parent.bounds.contains_bounds(&node.bounds) {
                return Err(InvariantViolation::new(
                    node.id,
                    "bounds escape the parent region",
                ));
            }
        }

        for node in self.nodes.values() {
            let Some(plane) = node.split else {
                continue;
            };
            let expected = node.id.children();
            if expected != Some([plane.low, plane.high]) {
                return Err(InvariantViolation::new(node.id, "children ids mismatch"));
            }
            let (Some(low), Some(high)) = (self.bounds(plane.low), self.bounds(plane.high))
            else {
                return Err(InvariantViolation::new(node.id, "missing child"));
            };
            if node.bounds.partition_axis(&low, &high) != Some(plane.axis) {
                return Err(InvariantViolation::new(
                    node.id,
                    "children do not partition the region",
                ));
            }
        }
        Ok(())
    }

    /// Iterate over every node in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &IndexNode> {
        self.nodes.values()
    }

    /// The split plane of an internal node.
    pub fn split_plane(&self, id: RegionId) -> Option<SplitPlane> {
        self.nodes.get(&id).and_then(|n| n.split)
    }

    /// The side of its parent a node's bounds lie on, read from the tree.
    pub fn side_of(&self, id: RegionId) -> Option<Side> {
        let parent = self.split_plane(id.parent()?)?;
        if parent.low == id {
            Some(Side::Low)
        } else if parent.high == id {
            Some(Side::High)
        } else {
            None
        }
    }
}
