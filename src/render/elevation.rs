use crate::{
    error::TerrainResult,
    render::readback::{CpuReadbackBackend, ReadbackBackend, ReadbackManager},
    terrain_data::{
        quadtree::TerrainQuadtree,
        tile_cache::TileCache,
        QuadCoordinate,
    },
};
use bevy::{
    log::{debug, trace},
    math::DVec2,
    utils::{HashMap, HashSet},
};
use std::{cmp::Reverse, collections::BinaryHeap};

/// The maximum number of tiles whose elevation bounds are read back per frame.
pub const MAX_PER_FRAME: usize = 16;

/// The side length of the blocks merged by each reduction pass.
const REDUCTION_BLOCK: usize = 4;

/// What a value of an elevation readback belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadbackTarget {
    /// The elevation bounds of the quad with the same coordinate as the tile.
    Quad(QuadCoordinate),
    /// The elevation below the camera.
    Camera,
}

/// Computes the elevation values that are read back, usually on the GPU.
pub trait ElevationReducer {
    /// The completion stamp of the tile, if its data is ready.
    fn stamp(&self, coordinate: QuadCoordinate) -> Option<u64>;

    /// The minimum and maximum elevation of the tile.
    fn min_max(&self, coordinate: QuadCoordinate) -> Option<(f32, f32)>;

    /// The elevation at the uv position inside the tile.
    fn sample(&self, coordinate: QuadCoordinate, uv: DVec2) -> Option<f32>;
}

/// Reduces the interior of a tile to its minimum and maximum.
///
/// Like the reduction shader, each pass merges blocks of 4x4 values into one, until
/// a single value is left. The border shared with the neighbouring tiles is ignored.
pub fn reduce_min_max(data: &[f32], tile_size: u32, border: u32) -> (f32, f32) {
    let tile_size = tile_size as usize;
    let border = border as usize;
    let mut size = tile_size.saturating_sub(2 * border);

    if size == 0 || data.len() < tile_size * tile_size {
        return (0.0, 0.0);
    }

    let mut values = (0..size * size)
        .map(|index| {
            let (x, y) = (index % size + border, index / size + border);
            let value = data[y * tile_size + x];
            (value, value)
        })
        .collect::<Vec<_>>();

    while size > 1 {
        let reduced_size = size.div_ceil(REDUCTION_BLOCK);

        values = (0..reduced_size * reduced_size)
            .map(|index| {
                let (bx, by) = (index % reduced_size, index / reduced_size);
                let mut result = (f32::INFINITY, f32::NEG_INFINITY);

                for y in by * REDUCTION_BLOCK..((by + 1) * REDUCTION_BLOCK).min(size) {
                    for x in bx * REDUCTION_BLOCK..((bx + 1) * REDUCTION_BLOCK).min(size) {
                        let (min, max) = values[y * size + x];
                        result = (result.0.min(min), result.1.max(max));
                    }
                }

                result
            })
            .collect();

        size = reduced_size;
    }

    values[0]
}

/// An [`ElevationReducer`] working on the CPU side data of a [`TileCache`].
pub struct CpuElevationReducer<'a> {
    cache: &'a TileCache,
}

impl<'a> CpuElevationReducer<'a> {
    pub fn new(cache: &'a TileCache) -> Self {
        Self { cache }
    }
}

impl ElevationReducer for CpuElevationReducer<'_> {
    fn stamp(&self, coordinate: QuadCoordinate) -> Option<u64> {
        self.cache.status(coordinate)?.completed_at()
    }

    fn min_max(&self, coordinate: QuadCoordinate) -> Option<(f32, f32)> {
        let data = self.cache.tile_data(coordinate)?;

        Some(reduce_min_max(
            data,
            self.cache.tile_size(),
            self.cache.border(),
        ))
    }

    fn sample(&self, coordinate: QuadCoordinate, uv: DVec2) -> Option<f32> {
        let data = self.cache.tile_data(coordinate)?;
        let tile_size = self.cache.tile_size() as usize;
        let border = self.cache.border() as usize;
        let last = tile_size.checked_sub(2 * border + 1)?;

        let position = uv.clamp(DVec2::ZERO, DVec2::ONE) * last as f64;
        let (x0, y0) = (
            (position.x.floor() as usize).min(last),
            (position.y.floor() as usize).min(last),
        );
        let (x1, y1) = ((x0 + 1).min(last), (y0 + 1).min(last));
        let (fx, fy) = (position.x - x0 as f64, position.y - y0 as f64);

        let value = |x: usize, y: usize| data[(y + border) * tile_size + x + border] as f64;

        let bottom = value(x0, y0) * (1.0 - fx) + value(x1, y0) * fx;
        let top = value(x0, y1) * (1.0 - fx) + value(x1, y1) * fx;

        Some((bottom * (1.0 - fy) + top * fy) as f32)
    }
}

/// Reads the elevation bounds of the quads and the elevation below the camera back
/// from the elevation tiles.
///
/// Pending tiles are serviced coarsest first, with up to [`MAX_PER_FRAME`] tiles per frame.
/// Tiles are read back again whenever they have been produced anew.
/// The results arrive after the delay of the [`ReadbackManager`] and are written into
/// the quadtree.
pub struct ElevationReadback<B: ReadbackBackend = CpuReadbackBackend> {
    manager: ReadbackManager<B, TerrainQuadtree>,
    queue: BinaryHeap<Reverse<(u32, u64, QuadCoordinate)>>,
    queued: HashSet<QuadCoordinate>,
    /// The completion stamps of the tiles as of their last readback.
    stamps: HashMap<QuadCoordinate, u64>,
    sequence: u64,
    camera_tile: Option<(QuadCoordinate, u64)>,
    last_frame: Option<u64>,
}

impl<B: ReadbackBackend> ElevationReadback<B> {
    pub fn new(backend: B, max_per_frame: usize, delay: usize) -> TerrainResult<Self> {
        Ok(Self {
            manager: ReadbackManager::new(backend, max_per_frame, delay)?,
            queue: BinaryHeap::new(),
            queued: HashSet::default(),
            stamps: HashMap::default(),
            sequence: 0,
            camera_tile: None,
            last_frame: None,
        })
    }

    /// The number of tiles waiting to be read back.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.manager.in_flight()
    }

    /// Delivers the results due this frame, then requests the next readback.
    ///
    /// Calling this more than once per frame has no effect.
    pub fn update(
        &mut self,
        frame: u64,
        quadtree: &mut TerrainQuadtree,
        reducer: &impl ElevationReducer,
    ) {
        if self.last_frame == Some(frame) {
            return;
        }

        self.last_frame = Some(frame);

        self.manager.new_frame(quadtree);
        self.enqueue(quadtree, reducer);

        let mut budget = MAX_PER_FRAME;

        while self.manager.can_readback() {
            if !self.dispatch(quadtree, reducer, &mut budget) {
                break;
            }
        }
    }

    fn enqueue(&mut self, quadtree: &TerrainQuadtree, reducer: &impl ElevationReducer) {
        self.stamps
            .retain(|coordinate, _| quadtree.find(*coordinate).is_some());

        for (_, quad) in quadtree.nodes() {
            let coordinate = quad.coordinate;

            let Some(stamp) = reducer.stamp(coordinate) else {
                continue;
            };

            if self.stamps.get(&coordinate) == Some(&stamp) || self.queued.contains(&coordinate) {
                continue;
            }

            self.queue
                .push(Reverse((coordinate.level, self.sequence, coordinate)));
            self.queued.insert(coordinate);
            self.sequence += 1;
        }
    }

    /// The finest tile with data above the camera, along with the uv position of the
    /// camera inside it.
    fn camera_tile(
        &self,
        quadtree: &TerrainQuadtree,
        reducer: &impl ElevationReducer,
    ) -> Option<(QuadCoordinate, u64, DVec2)> {
        let camera = quadtree.local_camera().truncate();
        let mut key = quadtree.find_leaf(camera)?;

        loop {
            let quad = quadtree.node(key);

            if let Some(stamp) = reducer.stamp(quad.coordinate) {
                let uv = (camera - DVec2::new(quad.ox, quad.oy)) / quad.l;
                return Some((quad.coordinate, stamp, uv));
            }

            key = quad.parent?;
        }
    }

    /// Starts a readback of at most `budget` of the next tiles, which are deducted from it.
    /// Returns false if there was nothing to read.
    fn dispatch(
        &mut self,
        quadtree: &TerrainQuadtree,
        reducer: &impl ElevationReducer,
        budget: &mut usize,
    ) -> bool {
        let mut targets = Vec::new();
        let mut values = Vec::new();

        while *budget > 0 {
            let Some(Reverse((_, _, coordinate))) = self.queue.pop() else {
                break;
            };

            self.queued.remove(&coordinate);

            if quadtree.find(coordinate).is_none() {
                continue;
            }

            let (Some(stamp), Some((min, max))) =
                (reducer.stamp(coordinate), reducer.min_max(coordinate))
            else {
                continue;
            };

            self.stamps.insert(coordinate, stamp);
            targets.push(ReadbackTarget::Quad(coordinate));
            values.extend([min, max]);
            *budget -= 1;
        }

        if let Some((coordinate, stamp, uv)) = self.camera_tile(quadtree, reducer) {
            if self.camera_tile != Some((coordinate, stamp)) {
                if let Some(height) = reducer.sample(coordinate, uv) {
                    self.camera_tile = Some((coordinate, stamp));
                    targets.push(ReadbackTarget::Camera);
                    values.extend([height, 0.0]);
                }
            }
        }

        if targets.is_empty() {
            return false;
        }

        trace!("Reading back the elevation of {} targets.", targets.len());

        self.manager
            .readback(bytemuck::cast_slice(values.as_slice()), move |quadtree, data| {
                apply_readback(quadtree, &targets, data);
            })
    }
}

fn apply_readback(quadtree: &mut TerrainQuadtree, targets: &[ReadbackTarget], data: &[u8]) {
    let values = data
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect::<Vec<_>>();

    for (target, value) in targets.iter().zip(values.chunks_exact(2)) {
        match *target {
            ReadbackTarget::Quad(coordinate) => {
                // the quad may have been merged in the meantime
                quadtree.set_elevation_bounds(coordinate, value[0] as f64, value[1] as f64);
            }
            ReadbackTarget::Camera => {
                quadtree.ground.next = value[0] as f64;
                debug!("Ground height below the camera: {:.3}.", value[0]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        math::Deformation,
        terrain_data::{
            quadtree::{
                tests::{settings, view},
                QuadtreeSettings,
            },
            task::TaskGraph,
            tile_cache::{tests::source, TileProducer},
            tile_tree::{SamplerPolicy, TileTreeSync},
        },
    };
    use bevy::math::DVec3;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn reduction_matches_a_direct_scan() {
        let mut rng = StdRng::seed_from_u64(7);

        for (tile_size, border) in [(6, 1), (19, 1), (36, 2), (67, 1)] {
            let data = (0..tile_size * tile_size)
                .map(|_| rng.random_range(-100.0..100.0))
                .collect::<Vec<f32>>();

            let interior = (0..tile_size * tile_size).filter(|index| {
                let (x, y) = (index % tile_size, index / tile_size);
                (border..tile_size - border).contains(&x) && (border..tile_size - border).contains(&y)
            });

            let min = interior.clone().map(|index| data[index]).fold(f32::INFINITY, f32::min);
            let max = interior.map(|index| data[index]).fold(f32::NEG_INFINITY, f32::max);

            assert_eq!(
                reduce_min_max(&data, tile_size as u32, border as u32),
                (min, max)
            );
        }
    }

    #[test]
    fn border_samples_are_ignored() {
        let mut data = vec![1.0; 36];
        data[0] = -50.0;
        data[35] = 50.0;

        assert_eq!(reduce_min_max(&data, 6, 1), (1.0, 1.0));
    }

    struct Setup {
        quadtree: TerrainQuadtree,
        cache: TileCache,
        sync: TileTreeSync,
    }

    fn setup() -> Setup {
        let mut quadtree = TerrainQuadtree::new(
            Deformation::Identity,
            QuadtreeSettings {
                split_invisible_quads: true,
                ..settings(2)
            },
        );
        quadtree.update(&view(
            DVec3::new(0.5, 0.5, 0.2),
            DVec3::new(0.5, 0.7, 0.0),
            DVec3::Z,
        ));

        let mut cache = TileCache::new("elevation", 64, source(4));
        let mut sync = TileTreeSync::new(
            "elevation",
            SamplerPolicy {
                store_invisible: true,
                ..Default::default()
            },
        )
        .unwrap();

        let mut graph = TaskGraph::new();
        sync.update(&quadtree, &mut cache, &mut graph).unwrap();
        cache.run_graph(&graph);

        Setup {
            quadtree,
            cache,
            sync,
        }
    }

    #[test]
    fn bounds_arrive_after_the_delay() {
        let Setup {
            mut quadtree,
            cache,
            ..
        } = setup();
        let mut readback = ElevationReadback::new(CpuReadbackBackend::new(), 1, 2).unwrap();

        readback.update(0, &mut quadtree, &CpuElevationReducer::new(&cache));
        assert_eq!(readback.in_flight(), 1);
        // a second call within the same frame is ignored
        readback.update(0, &mut quadtree, &CpuElevationReducer::new(&cache));
        assert_eq!(readback.in_flight(), 1);

        readback.update(1, &mut quadtree, &CpuElevationReducer::new(&cache));
        let root = quadtree.node(quadtree.root());
        assert_eq!((root.zmin, root.zmax), (0.0, 0.0));

        readback.update(2, &mut quadtree, &CpuElevationReducer::new(&cache));

        // the height function x + 2y spans [-3, 3] over the root
        let root = quadtree.node(quadtree.root());
        assert!((root.zmin + 3.0).abs() < 1e-5);
        assert!((root.zmax - 3.0).abs() < 1e-5);

        // the camera is above (0.5, 0.5)
        assert!((quadtree.ground.next - 1.5).abs() < 1e-5);
    }

    #[test]
    fn coarse_tiles_are_read_back_first() {
        let Setup {
            mut quadtree,
            cache,
            ..
        } = setup();
        let tiles = quadtree.len();
        assert!(tiles > MAX_PER_FRAME);

        let mut readback = ElevationReadback::new(CpuReadbackBackend::new(), 1, 1).unwrap();

        readback.update(0, &mut quadtree, &CpuElevationReducer::new(&cache));
        assert_eq!(readback.pending(), tiles - MAX_PER_FRAME);

        readback.update(1, &mut quadtree, &CpuElevationReducer::new(&cache));

        for (_, quad) in quadtree.nodes().filter(|(_, quad)| quad.level() < 2) {
            assert!(quad.zmax > quad.zmin, "{}", quad.coordinate);
        }

        readback.update(2, &mut quadtree, &CpuElevationReducer::new(&cache));
        readback.update(3, &mut quadtree, &CpuElevationReducer::new(&cache));
        assert_eq!(readback.pending(), 0);
        assert_eq!(readback.in_flight(), 0);

        for (_, quad) in quadtree.nodes() {
            let (min, max) = CpuElevationReducer::new(&cache)
                .min_max(quad.coordinate)
                .unwrap();
            assert_eq!((quad.zmin, quad.zmax), (min as f64, max as f64));
        }
    }

    #[test]
    fn concurrent_readbacks_share_the_tile_limit() {
        let Setup {
            mut quadtree,
            cache,
            ..
        } = setup();
        let tiles = quadtree.len();
        assert!(tiles > MAX_PER_FRAME);

        let mut readback = ElevationReadback::new(CpuReadbackBackend::new(), 4, 2).unwrap();

        readback.update(0, &mut quadtree, &CpuElevationReducer::new(&cache));
        assert_eq!(readback.pending(), tiles - MAX_PER_FRAME);
        assert_eq!(readback.in_flight(), 1);

        readback.update(1, &mut quadtree, &CpuElevationReducer::new(&cache));
        assert_eq!(readback.pending(), tiles.saturating_sub(2 * MAX_PER_FRAME));
    }

    #[test]
    fn recomputed_tiles_are_read_back_again() {
        let Setup {
            mut quadtree,
            mut cache,
            mut sync,
        } = setup();
        let mut readback = ElevationReadback::new(CpuReadbackBackend::new(), 1, 1).unwrap();

        for frame in 0..4 {
            readback.update(frame, &mut quadtree, &CpuElevationReducer::new(&cache));
        }
        assert_eq!(readback.pending(), 0);
        assert_eq!(readback.in_flight(), 0);

        cache.invalidate(QuadCoordinate::ROOT);
        cache.run_tasks(1);

        readback.update(4, &mut quadtree, &CpuElevationReducer::new(&cache));
        assert_eq!(readback.pending(), 0);
        // only the root, the tile below the camera did not change
        assert_eq!(readback.in_flight(), 1);

        sync.release_all(&mut cache);
        assert_eq!(cache.unused_tiles(), cache.len());
    }
}
