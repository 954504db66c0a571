//! Authoritative world state: a generational arena of in-world entities
//!
//! The world is owned exclusively by the tick driver; nothing else mutates
//! it. Sessions hold an [`EntityId`] rather than any direct reference, so a
//! disconnect can invalidate the slot and later lookups by a stale id fail
//! cleanly instead of dangling.

use log::info;
use std::collections::VecDeque;

use crate::session::SessionId;

/// Home tile new entities spawn on
pub const SPAWN_X: u16 = 3222;
pub const SPAWN_Y: u16 = 3218;

/// How far (in tiles, chebyshev) another entity can be and still appear in a
/// delta
pub const VIEW_DISTANCE: u16 = 15;

/// Index plus generation; a slot's generation is bumped on unbind so ids
/// handed out earlier stop resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId {
    pub index: usize,
    pub generation: u32,
}

impl EntityId {
    /// Grouping token tying scheduler tasks to this entity's lifetime
    pub fn bind_key(&self) -> u64 {
        self.index as u64
    }
}

/// One of the eight walkable directions, numbered as the wire protocol
/// expects them in 3-bit movement fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    NorthWest = 0,
    North = 1,
    NorthEast = 2,
    West = 3,
    East = 4,
    SouthWest = 5,
    South = 6,
    SouthEast = 7,
}

impl Direction {
    pub fn value(self) -> u32 {
        self as u32
    }

    pub fn between(from: (u16, u16), to: (u16, u16)) -> Option<Direction> {
        let dx = (to.0 as i32 - from.0 as i32).signum();
        let dy = (to.1 as i32 - from.1 as i32).signum();
        match (dx, dy) {
            (-1, 1) => Some(Direction::NorthWest),
            (0, 1) => Some(Direction::North),
            (1, 1) => Some(Direction::NorthEast),
            (-1, 0) => Some(Direction::West),
            (1, 0) => Some(Direction::East),
            (-1, -1) => Some(Direction::SouthWest),
            (0, -1) => Some(Direction::South),
            (1, -1) => Some(Direction::SouthEast),
            _ => None,
        }
    }

    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::NorthWest => (-1, 1),
            Direction::North => (0, 1),
            Direction::NorthEast => (1, 1),
            Direction::West => (-1, 0),
            Direction::East => (1, 0),
            Direction::SouthWest => (-1, -1),
            Direction::South => (0, -1),
            Direction::SouthEast => (1, -1),
        }
    }
}

/// One in-world actor bound to a logged-in session
#[derive(Debug)]
pub struct Entity {
    pub id: EntityId,
    pub session: SessionId,
    pub username: String,
    pub x: u16,
    pub y: u16,
    /// Tiles still to walk, one consumed per tick
    pub walk_queue: VecDeque<(u16, u16)>,
    /// Step taken this tick, if any; consumed by the update pipeline
    pub last_step: Option<Direction>,
    pub appearance_dirty: bool,
    pub chat: Option<String>,
}

impl Entity {
    fn new(id: EntityId, session: SessionId, username: String) -> Self {
        Self {
            id,
            session,
            username,
            x: SPAWN_X,
            y: SPAWN_Y,
            walk_queue: VecDeque::new(),
            last_step: None,
            // Everyone is announced on their first delta
            appearance_dirty: true,
            chat: None,
        }
    }

    /// Replaces the walk queue with a straight-line path to the destination
    pub fn walk_to(&mut self, dest_x: u16, dest_y: u16) {
        self.walk_queue.clear();
        let (mut x, mut y) = (self.x, self.y);
        while (x, y) != (dest_x, dest_y) {
            x = step_toward(x, dest_x);
            y = step_toward(y, dest_y);
            self.walk_queue.push_back((x, y));
        }
    }
}

fn step_toward(from: u16, to: u16) -> u16 {
    match from.cmp(&to) {
        std::cmp::Ordering::Less => from + 1,
        std::cmp::Ordering::Greater => from - 1,
        std::cmp::Ordering::Equal => from,
    }
}

/// Read-only per-entity snapshot handed to update workers
#[derive(Debug, Clone)]
pub struct EntityView {
    pub id: EntityId,
    pub session: SessionId,
    pub username: String,
    pub x: u16,
    pub y: u16,
    pub last_step: Option<Direction>,
    pub appearance_dirty: bool,
    pub chat: Option<String>,
}

pub struct World {
    slots: Vec<Option<Entity>>,
    generations: Vec<u32>,
    capacity: usize,
    pub tick: u64,
}

impl World {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            generations: Vec::new(),
            capacity,
            tick: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Binds a new entity for a freshly logged-in session. Returns `None`
    /// when the world is at capacity.
    pub fn bind(&mut self, session: SessionId, username: String) -> Option<EntityId> {
        if self.is_full() {
            return None;
        }

        let index = match self.slots.iter().position(|s| s.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.generations.push(0);
                self.slots.len() - 1
            }
        };

        let id = EntityId {
            index,
            generation: self.generations[index],
        };
        info!("bound entity {:?} for {}", id, username);
        self.slots[index] = Some(Entity::new(id, session, username));
        Some(id)
    }

    /// Removes the entity and invalidates its id. Returns false if the id
    /// was already stale.
    pub fn unbind(&mut self, id: EntityId) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        let entity = self.slots[id.index].take().unwrap();
        self.generations[id.index] = self.generations[id.index].wrapping_add(1);
        info!("unbound entity {:?} ({})", id, entity.username);
        true
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        match self.slots.get(id.index) {
            Some(Some(entity)) if self.generations[id.index] == id.generation => Some(entity),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        match self.slots.get_mut(id.index) {
            Some(Some(entity)) if self.generations[id.index] == id.generation => Some(entity),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn is_name_online(&self, username: &str) -> bool {
        self.iter()
            .any(|e| e.username.eq_ignore_ascii_case(username))
    }

    /// Advances every walk queue by one tile. Runs during the scheduler
    /// phase, before any update worker reads positions.
    pub fn step_walk_queues(&mut self) {
        for entity in self.slots.iter_mut().filter_map(|s| s.as_mut()) {
            match entity.walk_queue.pop_front() {
                Some((nx, ny)) => {
                    entity.last_step = Direction::between((entity.x, entity.y), (nx, ny));
                    entity.x = nx;
                    entity.y = ny;
                }
                None => entity.last_step = None,
            }
        }
    }

    /// Clones the per-entity state the update workers are allowed to read
    pub fn snapshot(&self) -> Vec<EntityView> {
        self.iter()
            .map(|e| EntityView {
                id: e.id,
                session: e.session,
                username: e.username.clone(),
                x: e.x,
                y: e.y,
                last_step: e.last_step,
                appearance_dirty: e.appearance_dirty,
                chat: e.chat.clone(),
            })
            .collect()
    }

    /// Clears the per-tick broadcast flags once their deltas have been
    /// handed off.
    pub fn clear_transient(&mut self) {
        for entity in self.slots.iter_mut().filter_map(|s| s.as_mut()) {
            entity.appearance_dirty = false;
            entity.chat = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_lookup() {
        let mut world = World::new(10);
        let id = world.bind(1, "alice".to_string()).unwrap();

        let entity = world.get(id).unwrap();
        assert_eq!(entity.username, "alice");
        assert_eq!((entity.x, entity.y), (SPAWN_X, SPAWN_Y));
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn test_capacity_enforced() {
        let mut world = World::new(2);
        assert!(world.bind(1, "a".to_string()).is_some());
        assert!(world.bind(2, "b".to_string()).is_some());
        assert!(world.bind(3, "c".to_string()).is_none());
        assert!(world.is_full());
    }

    #[test]
    fn test_stale_id_fails_after_slot_reuse() {
        let mut world = World::new(10);
        let first = world.bind(1, "alice".to_string()).unwrap();
        assert!(world.unbind(first));

        // Same slot, new generation
        let second = world.bind(2, "bob".to_string()).unwrap();
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);

        assert!(world.get(first).is_none());
        assert!(world.get_mut(first).is_none());
        assert_eq!(world.get(second).unwrap().username, "bob");
    }

    #[test]
    fn test_unbind_is_idempotent() {
        let mut world = World::new(10);
        let id = world.bind(1, "alice".to_string()).unwrap();
        assert!(world.unbind(id));
        assert!(!world.unbind(id));
    }

    #[test]
    fn test_name_online_case_insensitive() {
        let mut world = World::new(10);
        world.bind(1, "Alice".to_string()).unwrap();
        assert!(world.is_name_online("alice"));
        assert!(!world.is_name_online("bob"));
    }

    #[test]
    fn test_walk_queue_stepping() {
        let mut world = World::new(10);
        let id = world.bind(1, "alice".to_string()).unwrap();

        let entity = world.get_mut(id).unwrap();
        entity.walk_to(SPAWN_X + 2, SPAWN_Y);
        assert_eq!(entity.walk_queue.len(), 2);

        world.step_walk_queues();
        let entity = world.get(id).unwrap();
        assert_eq!(entity.x, SPAWN_X + 1);
        assert_eq!(entity.last_step, Some(Direction::East));

        world.step_walk_queues();
        world.step_walk_queues();
        let entity = world.get(id).unwrap();
        assert_eq!(entity.x, SPAWN_X + 2);
        // Queue exhausted, no step this tick
        assert_eq!(entity.last_step, None);
    }

    #[test]
    fn test_diagonal_direction() {
        assert_eq!(
            Direction::between((10, 10), (11, 11)),
            Some(Direction::NorthEast)
        );
        assert_eq!(
            Direction::between((10, 10), (9, 9)),
            Some(Direction::SouthWest)
        );
        assert_eq!(Direction::between((10, 10), (10, 10)), None);

        for dir in [
            Direction::North,
            Direction::SouthEast,
            Direction::West,
            Direction::NorthWest,
        ] {
            let (dx, dy) = dir.delta();
            let to = ((10 + dx) as u16, (10 + dy) as u16);
            assert_eq!(Direction::between((10, 10), to), Some(dir));
        }
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let mut world = World::new(10);
        let id = world.bind(7, "alice".to_string()).unwrap();
        world.get_mut(id).unwrap().chat = Some("hi".to_string());

        let snapshot = world.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].session, 7);
        assert_eq!(snapshot[0].chat.as_deref(), Some("hi"));

        world.clear_transient();
        assert!(world.get(id).unwrap().chat.is_none());
        assert!(!world.get(id).unwrap().appearance_dirty);
    }
}
