//! Entity records held by a cell.
//!
//! There is one record type per entity kind and no subclassing: an agent's
//! senses are an explicit [`Capabilities`] flag set checked directly, and the
//! [`EntityKind`] discriminator replaces type-based dispatch.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::geometry::{Bounds, Vec3};
use crate::ids::{AgentId, EventId, ObjectId};

/// Number of recent collisions remembered per agent.
pub const COLLISION_CAPACITY: usize = 5;

bitflags::bitflags! {
    /// Perception capabilities of an agent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capabilities: u8 {
        /// Directional sight, scoped by a view sector.
        const VISION = 0b0001;
        /// Hearing, scoped to the containing cell.
        const HEARING = 0b0010;
        /// Smell, scoped to the containing cell.
        const SMELL = 0b0100;
    }
}

impl Capabilities {
    /// Whether the agent senses its own cell regardless of direction.
    pub const fn senses_own_cell(self) -> bool {
        self.intersects(Self::HEARING.union(Self::SMELL))
    }
}

/// Kind discriminator for entity records and references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A perceiving, moving agent.
    Agent,
    /// A passive object occupying an area.
    Object,
    /// A pending event located at a point.
    Event,
}

/// Position and motion state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kinematics {
    /// Current position (center of the agent).
    pub position: Vec3,
    /// Velocity in world units per second.
    pub velocity: Vec3,
    /// Facing direction in the horizontal plane, radians from `+x`.
    pub heading: f64,
    /// Edge length of the agent's bounding cube.
    pub scale: f64,
}

impl Kinematics {
    /// A stationary unit-scale agent at `position` facing `+x`.
    pub const fn at(position: Vec3) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            heading: 0.0,
            scale: 1.0,
        }
    }

    /// Bounding cube for the current position and scale.
    pub fn bounding_box(&self) -> Bounds {
        Bounds::around(self.position, self.scale / 2.0)
    }
}

/// How far and how wide a vision-capable agent sees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisionRange {
    /// Full angular width of the view, radians.
    pub field_of_view: f64,
    /// View distance in world units.
    pub distance: f64,
}

impl Default for VisionRange {
    fn default() -> Self {
        Self {
            field_of_view: core::f64::consts::FRAC_PI_2,
            distance: 25.0,
        }
    }
}

/// One remembered collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collision {
    /// What the agent collided with.
    pub other: EntityRef,
    /// Tick at which the collision happened.
    pub tick: u64,
}

/// Bounded FIFO of recent collisions; the oldest entry is dropped when full.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollisionLog {
    entries: VecDeque<Collision>,
}

impl CollisionLog {
    /// Create an empty log.
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Record a collision, evicting the oldest beyond [`COLLISION_CAPACITY`].
    pub fn record(&mut self, collision: Collision) {
        self.entries.push_back(collision);
        while self.entries.len() > COLLISION_CAPACITY {
            self.entries.pop_front();
        }
    }

    /// Number of remembered collisions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent collision.
    pub fn latest(&self) -> Option<&Collision> {
        self.entries.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Collision> {
        self.entries.iter()
    }
}

/// An agent as stored in a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent identity.
    pub id: AgentId,
    /// Position and motion.
    pub kinematics: Kinematics,
    /// Senses the agent perceives with.
    pub capabilities: Capabilities,
    /// Vision parameters, used only with [`Capabilities::VISION`].
    pub vision: VisionRange,
    /// Recent collisions.
    pub collisions: CollisionLog,
}

impl AgentRecord {
    /// A stationary agent with vision and hearing.
    pub fn new(id: AgentId, position: Vec3) -> Self {
        Self {
            id,
            kinematics: Kinematics::at(position),
            capabilities: Capabilities::VISION | Capabilities::HEARING,
            vision: VisionRange::default(),
            collisions: CollisionLog::new(),
        }
    }

    /// Replace the capability set.
    #[must_use]
    pub const fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Current position.
    pub const fn position(&self) -> Vec3 {
        self.kinematics.position
    }

    /// Current bounding cube.
    pub fn bounding_box(&self) -> Bounds {
        self.kinematics.bounding_box()
    }
}

/// A passive object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object identity.
    pub id: ObjectId,
    /// Free-form label.
    pub label: String,
    /// Area the object occupies.
    pub bounds: Bounds,
    /// Whether agents and other objects may not overlap it.
    pub collidable: bool,
}

impl ObjectRecord {
    /// A collidable object occupying `bounds`.
    pub fn new(id: ObjectId, label: impl Into<String>, bounds: Bounds) -> Self {
        Self {
            id,
            label: label.into(),
            bounds,
            collidable: true,
        }
    }
}

/// A pending event located at a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event identity.
    pub id: EventId,
    /// Free-form label.
    pub label: String,
    /// Where the event happens.
    pub position: Vec3,
    /// Tick at which the event was raised.
    pub raised_at: u64,
    /// Lifetime in ticks; `None` keeps the event until removed.
    pub ttl_ticks: Option<u64>,
}

impl EventRecord {
    /// A non-expiring event.
    pub fn new(id: EventId, label: impl Into<String>, position: Vec3, raised_at: u64) -> Self {
        Self {
            id,
            label: label.into(),
            position,
            raised_at,
            ttl_ticks: None,
        }
    }

    /// Whether the event has outlived its TTL at `tick`.
    pub fn is_expired(&self, tick: u64) -> bool {
        self.ttl_ticks
            .is_some_and(|ttl| tick.saturating_sub(self.raised_at) >= ttl)
    }
}

/// Reference to an entity by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    /// An agent.
    Agent(AgentId),
    /// An object.
    Object(ObjectId),
    /// An event.
    Event(EventId),
}

impl EntityRef {
    /// Kind of the referenced entity.
    pub const fn kind(self) -> EntityKind {
        match self {
            Self::Agent(_) => EntityKind::Agent,
            Self::Object(_) => EntityKind::Object,
            Self::Event(_) => EntityKind::Event,
        }
    }
}

/// A full entity record of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    /// An agent record.
    Agent(AgentRecord),
    /// An object record.
    Object(ObjectRecord),
    /// An event record.
    Event(EventRecord),
}

impl Entity {
    /// Kind of the entity.
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Agent(_) => EntityKind::Agent,
            Self::Object(_) => EntityKind::Object,
            Self::Event(_) => EntityKind::Event,
        }
    }

    /// Reference to the entity.
    pub const fn entity_ref(&self) -> EntityRef {
        match self {
            Self::Agent(a) => EntityRef::Agent(a.id),
            Self::Object(o) => EntityRef::Object(o.id),
            Self::Event(e) => EntityRef::Event(e.id),
        }
    }

    /// Area the entity occupies: a box for objects, a point box otherwise.
    pub fn footprint(&self) -> Bounds {
        match self {
            Self::Agent(a) => Bounds::around(a.position(), 0.0),
            Self::Object(o) => o.bounds,
            Self::Event(e) => Bounds::around(e.position, 0.0),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn collision_log_drops_oldest() {
        let mut log = CollisionLog::new();
        let other = EntityRef::Agent(AgentId::new());
        for tick in 0..8 {
            log.record(Collision { other, tick });
        }
        assert_eq!(log.len(), COLLISION_CAPACITY);
        assert_eq!(log.iter().next().map(|c| c.tick), Some(3));
        assert_eq!(log.latest().map(|c| c.tick), Some(7));
    }

    #[test]
    fn capability_checks_are_direct() {
        let seeing = Capabilities::VISION;
        let smelling = Capabilities::SMELL;
        assert!(!seeing.senses_own_cell());
        assert!(smelling.senses_own_cell());
        assert!((seeing | smelling).contains(Capabilities::VISION));
    }

    #[test]
    fn event_ttl_expiry() {
        let mut event = EventRecord::new(EventId::new(), "noise", Vec3::ZERO, 10);
        assert!(!event.is_expired(1_000));
        event.ttl_ticks = Some(3);
        assert!(!event.is_expired(12));
        assert!(event.is_expired(13));
    }

    #[test]
    fn agent_bounding_box_follows_scale() {
        let mut agent = AgentRecord::new(AgentId::new(), Vec3::new(10.0, 10.0, 0.0));
        agent.kinematics.scale = 4.0;
        let bbox = agent.bounding_box();
        assert!(bbox.contains(Vec3::new(8.0, 8.0, -2.0)));
        assert!(!bbox.contains(Vec3::new(12.0, 10.0, 0.0)));
    }

    #[test]
    fn entity_kind_matches_reference() {
        let entity = Entity::Object(ObjectRecord::new(
            ObjectId::new(),
            "rock",
            Bounds::around(Vec3::ZERO, 1.0),
        ));
        assert_eq!(entity.kind(), EntityKind::Object);
        assert_eq!(entity.entity_ref().kind(), EntityKind::Object);
    }
}
