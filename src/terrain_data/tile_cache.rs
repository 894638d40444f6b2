use crate::{
    error::{TerrainError, TerrainResult},
    terrain_data::{
        task::{TaskGraph, TaskId, TaskStatus},
        QuadCoordinate,
    },
};
use bevy::{
    log::{debug, error, warn},
    math::DVec2,
    utils::HashMap,
};
use bitflags::bitflags;
use std::{collections::VecDeque, fmt, sync::Arc};

bitflags! {
    /// Options for acquiring a tile.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TileFlags: u32 {
        /// Produce the data of the tile before returning, if it is not ready yet.
        const PRODUCE_NOW = 1 << 0;
    }
}

/// A claim on a tile resident in a [`TileProducer`].
///
/// The tile stays resident as long as the lease is held.
/// Leases can not be cloned and are consumed when they are released, so each lease
/// is released at most once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TileLease {
    coordinate: QuadCoordinate,
    slot: u32,
    task: TaskId,
}

impl TileLease {
    pub fn new(coordinate: QuadCoordinate, slot: u32, task: TaskId) -> Self {
        Self {
            coordinate,
            slot,
            task,
        }
    }

    pub fn coordinate(&self) -> QuadCoordinate {
        self.coordinate
    }

    /// The index of the slot holding the data of the tile.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// The task producing the data of the tile.
    pub fn task(&self) -> TaskId {
        self.task
    }
}

/// The interface of a tile cache, which produces tiles and hands out leases to them.
pub trait TileProducer {
    /// Whether data exists for the given tile.
    fn has_tile(&self, coordinate: QuadCoordinate) -> bool;

    /// Whether data exists for the children of the given tile.
    fn has_children(&self, coordinate: QuadCoordinate) -> bool {
        self.has_tile(coordinate.child(0))
    }

    /// Acquires a lease on the tile, making it resident if necessary.
    ///
    /// Returns `None` if the cache has no room left.
    fn get_tile(&mut self, coordinate: QuadCoordinate, flags: TileFlags) -> Option<TileLease>;

    /// Acquires a lease on the tile only if it is already resident, without creating any
    /// new work. Prefetched tiles, which nobody uses yet, are only considered if
    /// `include_prefetched` is set.
    fn find_tile(&mut self, coordinate: QuadCoordinate, include_prefetched: bool)
        -> Option<TileLease>;

    /// Releases a lease.
    fn put_tile(&mut self, lease: TileLease);

    /// Whether the tile occupies a slot, either leased or waiting for eviction.
    fn is_resident(&self, coordinate: QuadCoordinate) -> bool;

    /// Requests the tile to be produced ahead of its use, without acquiring a lease.
    ///
    /// Returns false if the cache has no room for it.
    fn prefetch_tile(&mut self, coordinate: QuadCoordinate) -> bool;

    /// The number of resident tiles without any lease, which may be evicted.
    fn unused_tiles(&self) -> usize;

    /// The number of slots never used so far.
    fn free_slots(&self) -> usize;

    /// The task producing the leased tile and its current state.
    fn production(&self, lease: &TileLease) -> (TaskId, TaskStatus);
}

/// Supplies the data of the tiles stored in a [`TileCache`].
pub trait TileSource: Send + Sync {
    /// The number of samples per side, including the border.
    fn tile_size(&self) -> u32;

    /// The number of samples on each side, which overlap with the neighbouring tiles.
    fn border(&self) -> u32;

    fn max_level(&self) -> u32;

    fn has_tile(&self, coordinate: QuadCoordinate) -> bool {
        coordinate.is_valid() && coordinate.level <= self.max_level()
    }

    /// Writes the samples of the tile into `data`, row by row.
    fn produce(&self, coordinate: QuadCoordinate, data: &mut [f32]) -> TerrainResult<()>;
}

/// A [`TileSource`] sampling a height function over the root quad `[-size, size]²`.
pub struct HeightFunctionSource {
    pub tile_size: u32,
    pub border: u32,
    pub max_level: u32,
    pub size: f64,
    function: Box<dyn Fn(DVec2) -> f32 + Send + Sync>,
}

impl HeightFunctionSource {
    pub fn new(
        tile_size: u32,
        border: u32,
        max_level: u32,
        size: f64,
        function: impl Fn(DVec2) -> f32 + Send + Sync + 'static,
    ) -> Self {
        Self {
            tile_size,
            border,
            max_level,
            size,
            function: Box::new(function),
        }
    }

    /// The local position of a sample of the tile.
    pub fn sample_position(&self, coordinate: QuadCoordinate, x: u32, y: u32) -> DVec2 {
        let l = 2.0 * self.size / QuadCoordinate::count(coordinate.level) as f64;
        let origin = DVec2::new(
            -self.size + coordinate.tx as f64 * l,
            -self.size + coordinate.ty as f64 * l,
        );

        let interior = self.tile_size.saturating_sub(2 * self.border).max(2) - 1;
        let offset = DVec2::new(x as f64, y as f64) - self.border as f64;

        origin + offset * l / interior as f64
    }
}

impl fmt::Debug for HeightFunctionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeightFunctionSource")
            .field("tile_size", &self.tile_size)
            .field("border", &self.border)
            .field("max_level", &self.max_level)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl TileSource for HeightFunctionSource {
    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn border(&self) -> u32 {
        self.border
    }

    fn max_level(&self) -> u32 {
        self.max_level
    }

    fn produce(&self, coordinate: QuadCoordinate, data: &mut [f32]) -> TerrainResult<()> {
        if !self.has_tile(coordinate) {
            return Err(TerrainError::Production {
                coordinate,
                reason: format!("the source only has tiles up to level {}", self.max_level),
            });
        }

        let size = self.tile_size as usize;

        for (index, sample) in data.iter_mut().enumerate().take(size * size) {
            let (x, y) = ((index % size) as u32, (index / size) as u32);
            *sample = (self.function)(self.sample_position(coordinate, x, y));
        }

        Ok(())
    }
}

/// The internal representation of a resident tile in a [`TileCache`].
struct TileState {
    /// The slot holding the data of the tile.
    slot: u32,
    /// The count of leases currently held on the tile.
    users: u32,
    task: TaskId,
    status: TaskStatus,
}

/// A fixed size cache of tiles produced by a [`TileSource`].
///
/// Tiles are reference counted by their leases. Tiles without any lease stay resident
/// in an LRU queue until their slot is required for another tile.
/// Production is queued and executed cooperatively via [`TileCache::run_tasks`] and
/// [`TileCache::run_graph`].
pub struct TileCache {
    name: String,
    source: Arc<dyn TileSource>,
    tile_states: HashMap<QuadCoordinate, TileState>,
    /// Resident tiles without a lease, least recently used first.
    unused_tiles: VecDeque<QuadCoordinate>,
    free_slots: Vec<u32>,
    slots: Vec<Vec<f32>>,
    to_produce: VecDeque<QuadCoordinate>,
    tasks: HashMap<TaskId, QuadCoordinate>,
    next_task: u64,
    clock: u64,
}

impl TileCache {
    pub fn new(name: impl Into<String>, capacity: u32, source: Arc<dyn TileSource>) -> Self {
        let samples = (source.tile_size() * source.tile_size()) as usize;

        Self {
            name: name.into(),
            source,
            tile_states: HashMap::default(),
            unused_tiles: VecDeque::new(),
            free_slots: (0..capacity).rev().collect(),
            slots: vec![vec![0.0; samples]; capacity as usize],
            to_produce: VecDeque::new(),
            tasks: HashMap::default(),
            next_task: 0,
            clock: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn tile_size(&self) -> u32 {
        self.source.tile_size()
    }

    pub fn border(&self) -> u32 {
        self.source.border()
    }

    /// The number of resident tiles.
    pub fn len(&self) -> usize {
        self.tile_states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tile_states.is_empty()
    }

    /// The count of leases held on the tile.
    pub fn users(&self, coordinate: QuadCoordinate) -> u32 {
        self.tile_states
            .get(&coordinate)
            .map_or(0, |tile| tile.users)
    }

    pub fn status(&self, coordinate: QuadCoordinate) -> Option<TaskStatus> {
        self.tile_states.get(&coordinate).map(|tile| tile.status)
    }

    pub fn pending_tasks(&self) -> usize {
        self.to_produce.len()
    }

    /// The samples of a resident tile.
    pub fn tile_data(&self, coordinate: QuadCoordinate) -> Option<&[f32]> {
        self.tile_states
            .get(&coordinate)
            .map(|tile| self.slots[tile.slot as usize].as_slice())
    }

    pub fn slot_data(&self, slot: u32) -> &[f32] {
        &self.slots[slot as usize]
    }

    /// Requests the tile to be produced again, for example because its source data changed.
    ///
    /// Its next completion receives a newer stamp.
    pub fn invalidate(&mut self, coordinate: QuadCoordinate) {
        if let Some(tile) = self.tile_states.get_mut(&coordinate) {
            tile.status = TaskStatus::Pending;

            if !self.to_produce.contains(&coordinate) {
                self.to_produce.push_back(coordinate);
            }
        }
    }

    /// Executes up to `budget` pending production tasks in request order.
    pub fn run_tasks(&mut self, budget: usize) -> usize {
        let mut executed = 0;

        while executed < budget {
            let Some(coordinate) = self.to_produce.pop_front() else {
                break;
            };

            self.produce(coordinate);
            executed += 1;
        }

        executed
    }

    /// Executes the production tasks of this cache that are part of the graph.
    pub fn run_graph(&mut self, graph: &TaskGraph) -> usize {
        let mut executed = 0;

        for task in graph.execution_order() {
            let Some(&coordinate) = self.tasks.get(&task) else {
                continue;
            };

            if self.status(coordinate) == Some(TaskStatus::Pending) {
                self.to_produce.retain(|pending| *pending != coordinate);
                self.produce(coordinate);
                executed += 1;
            }
        }

        executed
    }

    fn produce(&mut self, coordinate: QuadCoordinate) {
        let Some(tile) = self.tile_states.get_mut(&coordinate) else {
            return;
        };

        let data = &mut self.slots[tile.slot as usize];

        if let Err(error) = self.source.produce(coordinate, data) {
            error!("Tile cache '{}': {error}", self.name);
            data.fill(0.0);
        }

        self.clock += 1;
        tile.status = TaskStatus::Done {
            completed_at: self.clock,
        };
    }

    /// Finds a slot for a new tile, evicting the least recently used tile if necessary.
    fn allocate_slot(&mut self) -> Option<u32> {
        if let Some(slot) = self.free_slots.pop() {
            return Some(slot);
        }

        let evicted = self.unused_tiles.pop_front()?;
        let tile = self.tile_states.remove(&evicted)?;

        self.tasks.remove(&tile.task);
        self.to_produce.retain(|pending| *pending != evicted);

        debug!("Tile cache '{}' evicted tile {evicted}.", self.name);

        Some(tile.slot)
    }

    fn insert_tile(&mut self, coordinate: QuadCoordinate, slot: u32, users: u32) -> TaskId {
        let task = TaskId(self.next_task);
        self.next_task += 1;

        self.tile_states.insert(
            coordinate,
            TileState {
                slot,
                users,
                task,
                status: TaskStatus::Pending,
            },
        );
        self.tasks.insert(task, coordinate);
        self.to_produce.push_back(coordinate);

        task
    }
}

impl TileProducer for TileCache {
    fn has_tile(&self, coordinate: QuadCoordinate) -> bool {
        self.source.has_tile(coordinate)
    }

    fn get_tile(&mut self, coordinate: QuadCoordinate, flags: TileFlags) -> Option<TileLease> {
        if !self.has_tile(coordinate) {
            return None;
        }

        let lease = if let Some(tile) = self.tile_states.get_mut(&coordinate) {
            if tile.users == 0 {
                // the tile is now used again
                self.unused_tiles.retain(|unused| *unused != coordinate);
            }

            tile.users += 1;

            TileLease::new(coordinate, tile.slot, tile.task)
        } else {
            let slot = self.allocate_slot()?;
            let task = self.insert_tile(coordinate, slot, 1);

            TileLease::new(coordinate, slot, task)
        };

        if flags.contains(TileFlags::PRODUCE_NOW) && self.status(coordinate) == Some(TaskStatus::Pending) {
            self.to_produce.retain(|pending| *pending != coordinate);
            self.produce(coordinate);
        }

        Some(lease)
    }

    fn find_tile(
        &mut self,
        coordinate: QuadCoordinate,
        include_prefetched: bool,
    ) -> Option<TileLease> {
        let tile = self.tile_states.get_mut(&coordinate)?;

        if tile.users == 0 {
            if !include_prefetched {
                return None;
            }

            self.unused_tiles.retain(|unused| *unused != coordinate);
        }

        tile.users += 1;

        Some(TileLease::new(coordinate, tile.slot, tile.task))
    }

    fn put_tile(&mut self, lease: TileLease) {
        let Some(tile) = self.tile_states.get_mut(&lease.coordinate) else {
            warn!(
                "Tile cache '{}': released tile {}, which is not resident.",
                self.name, lease.coordinate
            );
            return;
        };

        tile.users = tile.users.saturating_sub(1);

        if tile.users == 0 {
            // the tile is not used anymore
            self.unused_tiles.push_back(lease.coordinate);
        }
    }

    fn is_resident(&self, coordinate: QuadCoordinate) -> bool {
        self.tile_states.contains_key(&coordinate)
    }

    fn prefetch_tile(&mut self, coordinate: QuadCoordinate) -> bool {
        if self.is_resident(coordinate) {
            return true;
        }

        if !self.has_tile(coordinate) {
            return false;
        }

        let Some(slot) = self.allocate_slot() else {
            return false;
        };

        self.insert_tile(coordinate, slot, 0);
        self.unused_tiles.push_back(coordinate);

        true
    }

    fn unused_tiles(&self) -> usize {
        self.unused_tiles.len()
    }

    fn free_slots(&self) -> usize {
        self.free_slots.len()
    }

    fn production(&self, lease: &TileLease) -> (TaskId, TaskStatus) {
        let status = self
            .tile_states
            .get(&lease.coordinate)
            .filter(|tile| tile.task == lease.task)
            .map_or(TaskStatus::Pending, |tile| tile.status);

        (lease.task, status)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn source(max_level: u32) -> Arc<dyn TileSource> {
        Arc::new(HeightFunctionSource::new(6, 1, max_level, 1.0, |position| {
            (position.x + 2.0 * position.y) as f32
        }))
    }

    fn coordinate(level: u32, tx: u32, ty: u32) -> QuadCoordinate {
        QuadCoordinate::new(level, tx, ty)
    }

    #[test]
    fn unused_tiles_are_evicted_least_recently_used_first() {
        let mut cache = TileCache::new("height", 2, source(4));

        let a = cache.get_tile(coordinate(1, 0, 0), TileFlags::empty()).unwrap();
        let b = cache.get_tile(coordinate(1, 1, 0), TileFlags::empty()).unwrap();
        assert!(cache.get_tile(coordinate(1, 0, 1), TileFlags::empty()).is_none());

        cache.put_tile(b);
        cache.put_tile(a);
        assert_eq!(cache.unused_tiles(), 2);
        assert_eq!(cache.free_slots(), 0);

        let c = cache.get_tile(coordinate(1, 0, 1), TileFlags::empty()).unwrap();
        assert!(!cache.is_resident(coordinate(1, 1, 0)));
        assert!(cache.is_resident(coordinate(1, 0, 0)));

        // reusing an unused tile keeps it resident
        let a = cache.get_tile(coordinate(1, 0, 0), TileFlags::empty()).unwrap();
        assert_eq!(cache.unused_tiles(), 0);
        assert_eq!(cache.users(coordinate(1, 0, 0)), 1);

        cache.put_tile(a);
        cache.put_tile(c);
    }

    #[test]
    fn prefetched_tiles_are_only_found_on_request() {
        let mut cache = TileCache::new("height", 4, source(4));

        assert!(cache.prefetch_tile(coordinate(2, 1, 1)));
        assert_eq!(cache.users(coordinate(2, 1, 1)), 0);
        assert_eq!(cache.unused_tiles(), 1);

        assert!(cache.find_tile(coordinate(2, 1, 1), false).is_none());
        let lease = cache.find_tile(coordinate(2, 1, 1), true).unwrap();
        assert_eq!(cache.users(coordinate(2, 1, 1)), 1);
        assert_eq!(cache.unused_tiles(), 0);

        let (_, status) = cache.production(&lease);
        assert_eq!(status, TaskStatus::Pending);
        assert_eq!(cache.run_tasks(8), 1);
        assert!(cache.production(&lease).1.is_done());

        assert!(!cache.prefetch_tile(coordinate(5, 0, 0)));
        assert!(cache.find_tile(coordinate(3, 0, 0), true).is_none());
    }

    #[test]
    fn production_follows_the_task_graph() {
        let mut cache = TileCache::new("height", 4, source(4));

        let a = cache.get_tile(coordinate(0, 0, 0), TileFlags::empty()).unwrap();
        let b = cache.get_tile(coordinate(1, 0, 0), TileFlags::empty()).unwrap();
        assert_eq!(cache.pending_tasks(), 2);

        let mut graph = TaskGraph::new();
        graph.add_task(b.task(), b.coordinate().to_string());

        assert_eq!(cache.run_graph(&graph), 1);
        assert!(cache.production(&b).1.is_done());
        assert!(!cache.production(&a).1.is_done());
        assert_eq!(cache.pending_tasks(), 1);

        let c = cache
            .get_tile(coordinate(1, 1, 1), TileFlags::PRODUCE_NOW)
            .unwrap();
        assert!(cache.production(&c).1.is_done());
    }

    #[test]
    fn invalidation_produces_newer_stamps() {
        let mut cache = TileCache::new("height", 1, source(4));

        let lease = cache.get_tile(coordinate(0, 0, 0), TileFlags::PRODUCE_NOW).unwrap();
        let first = cache.production(&lease).1.completed_at().unwrap();

        cache.invalidate(coordinate(0, 0, 0));
        assert!(!cache.production(&lease).1.is_done());

        cache.run_tasks(1);
        let second = cache.production(&lease).1.completed_at().unwrap();

        assert!(second > first);
    }

    #[test]
    fn height_function_samples_the_quad() {
        let mut cache = TileCache::new("height", 1, source(4));
        let lease = cache.get_tile(coordinate(1, 1, 0), TileFlags::PRODUCE_NOW).unwrap();

        // the interior spans [0, 1] x [-1, 0]
        let data = cache.slot_data(lease.slot());
        assert_eq!(data.len(), 36);
        assert_eq!(data[6 + 1], 0.0 + 2.0 * -1.0);
        assert_eq!(data[4 * 6 + 4], 1.0 + 2.0 * 0.0);
    }

    #[test]
    fn failed_production_is_reported_as_error() {
        let source = HeightFunctionSource::new(4, 0, 2, 1.0, |_| 1.0);
        let mut data = vec![0.0; 16];

        assert!(matches!(
            source.produce(coordinate(3, 0, 0), &mut data),
            Err(TerrainError::Production { .. })
        ));
        assert!(source.produce(coordinate(2, 3, 3), &mut data).is_ok());
        assert!(data.iter().all(|sample| *sample == 1.0));
    }
}
