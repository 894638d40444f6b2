//! Types for configuring terrains and the systems driving them each frame.

use crate::{
    config::TerrainConfig,
    debug::DebugTerrain,
    error::{TerrainError, TerrainResult},
    render::{
        draw::{DrawCommand, DrawTraversal},
        elevation::{CpuElevationReducer, ElevationReadback},
        readback::CpuReadbackBackend,
        uniforms::{ProgramLayout, QuadUniform, TerrainUniform, TileUniform, UniformBindings},
    },
    shared::{lock, SharedStates},
    terrain_data::{
        quadtree::{TerrainQuadtree, ViewInput},
        task::TaskGraph,
        tile_cache::{TileCache, TileProducer, TileSource},
        tile_tree::TileTreeSync,
    },
    terrain_view::{camera_view_input, TerrainView},
};
use bevy::{core::FrameCount, prelude::*, utils::HashMap};
use std::sync::{Arc, Mutex};

/// The sources of the tile storages, by storage name.
#[derive(Resource, Default)]
pub struct TileSources {
    sources: HashMap<String, Arc<dyn TileSource>>,
}

impl TileSources {
    pub fn insert(&mut self, storage: impl Into<String>, source: Arc<dyn TileSource>) -> &mut Self {
        self.sources.insert(storage.into(), source);
        self
    }

    pub fn get(&self, storage: &str) -> Option<Arc<dyn TileSource>> {
        self.sources.get(storage).cloned()
    }
}

/// The tile caches, shared by all samplers using the same storage.
#[derive(Resource, Default, Deref, DerefMut)]
pub struct TileCaches(pub SharedStates<String, TileCache>);

/// The elevation readback of each terrain with an elevation sampler.
#[derive(Resource, Default, Deref, DerefMut)]
pub struct ElevationReadbacks(pub HashMap<Entity, ElevationReadback>);

/// Loads the [`TerrainConfig`] of the terrain from a `*.terrain.ron` asset.
#[derive(Component, Clone, Debug)]
pub struct TerrainConfigHandle(pub Handle<TerrainConfig>);

/// The uniform layout of the program drawing the terrain.
#[derive(Component, Clone, Debug, Default, Deref)]
pub struct TerrainProgram(pub ProgramLayout);

/// A kind of data of the terrain, with its tile tree and the cache it leases from.
pub struct TerrainSampler {
    pub name: String,
    pub storage: String,
    /// Whether the elevation bounds are read back from this sampler.
    pub elevation: bool,
    pub tile_tree: TileTreeSync,
    /// The productions the current frame waits for.
    pub graph: TaskGraph,
    cache: Arc<Mutex<TileCache>>,
}

impl TerrainSampler {
    pub fn cache(&self) -> &Arc<Mutex<TileCache>> {
        &self.cache
    }
}

impl Drop for TerrainSampler {
    fn drop(&mut self) {
        let mut cache = lock(&self.cache);
        self.tile_tree.release_all(&mut *cache);
    }
}

/// The draw commands of the current frame, along with their uniforms.
#[derive(Clone, Debug, Default)]
pub struct TerrainDraws {
    pub commands: Vec<DrawCommand>,
    pub terrain: TerrainUniform,
    /// One uniform per command.
    pub quads: Vec<QuadUniform>,
    /// One uniform per sampler and command, grouped by sampler.
    pub tiles: Vec<TileUniform>,
}

impl TerrainDraws {
    pub fn tile(&self, sampler: usize, command: usize) -> Option<&TileUniform> {
        self.tiles.get(sampler * self.commands.len() + command)
    }
}

/// The state of a terrain.
///
/// It is created from the [`TerrainConfig`] of the entity once the sources of all
/// of its storages are registered.
#[derive(Component)]
pub struct Terrain {
    pub quadtree: TerrainQuadtree,
    pub samplers: Vec<TerrainSampler>,
    pub traversal: DrawTraversal,
    pub bindings: UniformBindings,
    pub draws: TerrainDraws,
    tasks_per_frame: usize,
    horizon_culling: bool,
}

impl Terrain {
    pub fn new(
        config: &TerrainConfig,
        sources: &TileSources,
        caches: &mut TileCaches,
    ) -> TerrainResult<Self> {
        config.validate()?;

        let mut samplers = Vec::with_capacity(config.samplers.len());

        for sampler in &config.samplers {
            // the source is only required to create the cache of a new storage
            let cache = caches.try_get_or_insert_with(sampler.storage.clone(), || {
                let source = sources
                    .get(&sampler.storage)
                    .ok_or_else(|| TerrainError::UnknownStorage(sampler.storage.clone()))?;

                Ok::<_, TerrainError>(TileCache::new(
                    sampler.storage.clone(),
                    sampler.capacity,
                    source,
                ))
            })?;

            samplers.push(TerrainSampler {
                name: sampler.name.clone(),
                storage: sampler.storage.clone(),
                elevation: sampler.elevation,
                tile_tree: TileTreeSync::new(sampler.name.clone(), sampler.policy)?,
                graph: TaskGraph::new(),
                cache,
            });
        }

        Ok(Self {
            quadtree: TerrainQuadtree::new(config.deformation, config.quadtree.clone()),
            traversal: DrawTraversal::new(config.grid_size, config.is_asynchronous()),
            bindings: UniformBindings::new(config.samplers.iter().map(|sampler| sampler.name.as_str())),
            draws: TerrainDraws::default(),
            tasks_per_frame: config.tasks_per_frame,
            horizon_culling: config.quadtree.horizon_culling,
            samplers,
        })
    }

    pub fn sampler(&self, name: &str) -> Option<&TerrainSampler> {
        self.samplers.iter().find(|sampler| sampler.name == name)
    }

    /// The cache the elevation is read back from.
    pub fn elevation_cache(&self) -> Option<Arc<Mutex<TileCache>>> {
        self.samplers
            .iter()
            .find(|sampler| sampler.elevation)
            .map(|sampler| sampler.cache.clone())
    }

    /// Adapts the quadtree to the view.
    ///
    /// Horizon culling only happens if both the config and `horizon_culling` enable it.
    pub fn update(&mut self, view: &ViewInput, horizon_culling: bool) {
        self.quadtree.settings.horizon_culling = self.horizon_culling && horizon_culling;
        self.quadtree.update(view);
    }

    /// Synchronizes the tile trees with the quadtree and produces the tiles required
    /// to draw the current frame.
    ///
    /// Asynchronous samplers additionally prefetch the tiles of the next level, and the
    /// pending tasks of all caches advance by the configured number of tasks per frame.
    pub fn sync_tiles(&mut self) -> TerrainResult<()> {
        for sampler in &mut self.samplers {
            let mut cache = lock(&sampler.cache);

            sampler.graph.clear();
            sampler
                .tile_tree
                .update(&self.quadtree, &mut *cache, &mut sampler.graph)?;
            cache.run_graph(&sampler.graph);
        }

        let mut storages = Vec::new();

        for sampler in &mut self.samplers {
            let mut cache = lock(&sampler.cache);

            if sampler.tile_tree.policy().asynchronous {
                let quota = cache.unused_tiles() + cache.free_slots();
                sampler.tile_tree.prefetch(&self.quadtree, &mut *cache, quota);
            }

            if !storages.contains(&sampler.storage) {
                storages.push(sampler.storage.clone());
                cache.run_tasks(self.tasks_per_frame);
            }
        }

        for sampler in &self.samplers {
            let cache = lock(&sampler.cache);
            sampler.tile_tree.mark_drawable(&mut self.quadtree, &*cache);
        }

        Ok(())
    }

    /// Collects the draw commands of the frame and computes their uniforms.
    pub fn collect_draws(&mut self) {
        let commands = self.traversal.collect(&self.quadtree);

        let quads = commands
            .iter()
            .map(|command| QuadUniform::new(&self.quadtree, command.quad))
            .collect();

        let mut tiles = Vec::with_capacity(commands.len() * self.samplers.len());

        for sampler in &self.samplers {
            let cache = lock(&sampler.cache);
            let (tile_size, border) = (cache.tile_size(), cache.border());

            tiles.extend(commands.iter().map(|command| {
                sampler
                    .tile_tree
                    .lookup(&*cache, command.coordinate)
                    .map(|lookup| TileUniform::new(&lookup, tile_size, border))
                    .unwrap_or_default()
            }));
        }

        self.draws = TerrainDraws {
            commands,
            terrain: TerrainUniform::new(&self.quadtree),
            quads,
            tiles,
        };
    }
}

pub(crate) fn load_terrain_configs(
    mut commands: Commands,
    configs: Res<Assets<TerrainConfig>>,
    terrains: Query<(Entity, &TerrainConfigHandle), (Without<TerrainConfig>, Without<Terrain>)>,
) {
    for (entity, handle) in &terrains {
        if let Some(config) = configs.get(&handle.0) {
            commands.entity(entity).insert(config.clone());
        }
    }
}

pub(crate) fn initialize_terrains(
    mut commands: Commands,
    sources: Res<TileSources>,
    mut caches: ResMut<TileCaches>,
    mut readbacks: ResMut<ElevationReadbacks>,
    terrains: Query<(Entity, &TerrainConfig), Without<Terrain>>,
) {
    for (entity, config) in &terrains {
        let terrain = Terrain::new(config, &sources, &mut caches).and_then(|terrain| {
            let readback = match terrain.elevation_cache() {
                Some(_) => Some(ElevationReadback::new(
                    CpuReadbackBackend::new(),
                    config.readback.max_per_frame,
                    config.readback.delay,
                )?),
                None => None,
            };

            Ok((terrain, readback))
        });

        match terrain {
            Ok((terrain, readback)) => {
                info!(
                    "Initialized terrain {entity} with the samplers {:?}.",
                    config
                        .samplers
                        .iter()
                        .map(|sampler| sampler.name.as_str())
                        .collect::<Vec<_>>()
                );

                if let Some(readback) = readback {
                    readbacks.insert(entity, readback);
                }

                commands.entity(entity).insert(terrain);
            }
            Err(error) => {
                error!("Failed to initialize terrain {entity}: {error}");
                commands
                    .entity(entity)
                    .remove::<(TerrainConfig, TerrainConfigHandle)>();
            }
        }
    }
}

pub(crate) fn update_quadtrees(
    debug: Res<DebugTerrain>,
    views: Query<(&Camera, &GlobalTransform), With<TerrainView>>,
    mut terrains: Query<(&mut Terrain, Option<&GlobalTransform>)>,
) {
    if debug.freeze {
        return;
    }

    let Some((camera, camera_transform)) = views.iter().find(|(camera, _)| camera.is_active)
    else {
        return;
    };

    for (mut terrain, terrain_transform) in &mut terrains {
        let terrain_transform = terrain_transform.unwrap_or(&GlobalTransform::IDENTITY);

        if let Some(view) = camera_view_input(camera, camera_transform, terrain_transform) {
            terrain.update(&view, debug.horizon_culling);
        }
    }
}

pub(crate) fn sync_terrain_tiles(
    mut commands: Commands,
    debug: Res<DebugTerrain>,
    mut terrains: Query<(Entity, &mut Terrain)>,
) {
    if debug.freeze {
        return;
    }

    for (entity, mut terrain) in &mut terrains {
        if let Err(error) = terrain.sync_tiles() {
            // an undersized cache is a configuration error, the terrain is not retried
            error!("Disabling terrain {entity}: {error}");
            commands
                .entity(entity)
                .remove::<(Terrain, TerrainConfig, TerrainConfigHandle)>();
        }
    }
}

pub(crate) fn read_back_elevation(
    frame: Res<FrameCount>,
    mut readbacks: ResMut<ElevationReadbacks>,
    mut terrains: Query<(Entity, &mut Terrain)>,
) {
    for (entity, mut terrain) in &mut terrains {
        let (Some(readback), Some(cache)) = (readbacks.get_mut(&entity), terrain.elevation_cache())
        else {
            continue;
        };

        let cache = lock(&cache);
        readback.update(
            frame.0 as u64,
            &mut terrain.quadtree,
            &CpuElevationReducer::new(&cache),
        );
    }
}

pub(crate) fn collect_terrain_draws(mut terrains: Query<(&mut Terrain, Option<&TerrainProgram>)>) {
    for (mut terrain, program) in &mut terrains {
        if let Some(program) = program {
            terrain.bindings.resolve(program);
        }

        terrain.collect_draws();
    }
}

pub(crate) fn remove_terrains(
    mut removed: RemovedComponents<Terrain>,
    mut readbacks: ResMut<ElevationReadbacks>,
    mut caches: ResMut<TileCaches>,
) {
    let mut any_removed = false;

    for entity in removed.read() {
        readbacks.remove(&entity);
        any_removed = true;
    }

    if any_removed {
        let count = caches.remove_unused();

        if count > 0 {
            debug!("Dropped {count} unused tile caches.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SamplerConfig,
        math::Deformation,
        render::draw::DrawRanges,
        terrain_data::{
            quadtree::tests::{settings, view},
            tile_cache::tests::source,
            tile_tree::SamplerPolicy,
        },
    };
    use bevy::{ecs::system::RunSystemOnce, math::DVec3};

    fn sources() -> TileSources {
        let mut sources = TileSources::default();
        sources.insert("dem", source(4));
        sources
    }

    fn config(policy: SamplerPolicy) -> TerrainConfig {
        TerrainConfig {
            deformation: Deformation::Identity,
            quadtree: settings(3),
            grid_size: 8,
            samplers: vec![SamplerConfig {
                storage: "dem".into(),
                capacity: 256,
                policy,
                ..default()
            }],
            ..default()
        }
    }

    fn eye() -> ViewInput {
        view(DVec3::new(0.2, -0.4, 0.1), DVec3::new(0.2, 0.2, 0.0), DVec3::Z)
    }

    #[test]
    fn unknown_storages_are_rejected() {
        let mut caches = TileCaches::default();
        let result = Terrain::new(&config(default()), &TileSources::default(), &mut caches);

        assert_eq!(result.err(), Some(TerrainError::UnknownStorage("dem".into())));
        assert!(caches.is_empty());
    }

    #[test]
    fn existing_caches_do_not_require_a_source() {
        let mut caches = TileCaches::default();
        let first = Terrain::new(&config(default()), &sources(), &mut caches).unwrap();

        let second = Terrain::new(&config(default()), &TileSources::default(), &mut caches).unwrap();

        assert_eq!(caches.len(), 1);
        assert!(Arc::ptr_eq(first.samplers[0].cache(), second.samplers[0].cache()));
    }

    #[test]
    fn samplers_share_the_cache_of_their_storage() {
        let mut config = config(default());
        config.samplers.push(SamplerConfig {
            name: "normals".into(),
            storage: "dem".into(),
            elevation: false,
            ..default()
        });

        let mut caches = TileCaches::default();
        let first = Terrain::new(&config, &sources(), &mut caches).unwrap();
        let second = Terrain::new(&config, &sources(), &mut caches).unwrap();

        assert_eq!(caches.len(), 1);
        assert!(Arc::ptr_eq(first.samplers[0].cache(), first.samplers[1].cache()));
        assert!(Arc::ptr_eq(first.samplers[0].cache(), second.samplers[0].cache()));
        assert_eq!(first.bindings.names().len(), 7 + 6);
    }

    #[test]
    fn synchronous_frames_draw_every_visible_leaf_with_its_tile() {
        let mut caches = TileCaches::default();
        let mut terrain = Terrain::new(&config(default()), &sources(), &mut caches).unwrap();

        terrain.update(&eye(), true);
        terrain.sync_tiles().unwrap();
        terrain.collect_draws();

        let draws = &terrain.draws;
        let visible_leaves = terrain
            .quadtree
            .leaves()
            .filter(|(_, quad)| quad.is_visible())
            .count();

        assert_eq!(draws.commands.len(), visible_leaves);
        assert_eq!(draws.quads.len(), visible_leaves);
        assert_eq!(draws.tiles.len(), visible_leaves);
        assert!(draws
            .commands
            .iter()
            .all(|command| command.ranges == DrawRanges::Full));

        // every drawn tile is resident and done
        let cache = lock(terrain.samplers[0].cache());
        for command in &draws.commands {
            assert!(cache.status(command.coordinate).is_some_and(|status| status.is_done()));
        }

        // the quads are drawn with their own tiles, which are not blended with a parent
        let tile = draws.tile(0, 0).unwrap();
        assert_eq!(tile.blend, 0.0);
        assert_eq!(tile.size.z, 6.0);
    }

    #[test]
    fn asynchronous_frames_fill_in_with_coarser_quads() {
        let policy = SamplerPolicy {
            asynchronous: true,
            ..default()
        };

        let mut config = config(policy);
        config.tasks_per_frame = 0;

        let mut caches = TileCaches::default();
        let mut terrain = Terrain::new(&config, &sources(), &mut caches).unwrap();

        terrain.update(&eye(), true);
        terrain.sync_tiles().unwrap();
        terrain.collect_draws();

        // only the root has been produced so far
        assert_eq!(terrain.draws.commands.len(), 1);
        assert_eq!(terrain.draws.commands[0].quad, terrain.quadtree.root());

        terrain.tasks_per_frame = usize::MAX;

        for _ in 0..4 {
            terrain.update(&eye(), true);
            terrain.sync_tiles().unwrap();
        }

        terrain.collect_draws();

        let visible_leaves = terrain
            .quadtree
            .leaves()
            .filter(|(_, quad)| quad.is_visible())
            .count();
        assert_eq!(terrain.draws.commands.len(), visible_leaves);
    }

    #[test]
    fn elevation_bounds_are_read_back_into_the_quadtree() {
        let mut caches = TileCaches::default();
        let mut terrain = Terrain::new(&config(default()), &sources(), &mut caches).unwrap();
        let mut readback = ElevationReadback::new(CpuReadbackBackend::new(), 4, 1).unwrap();

        for frame in 0..8 {
            terrain.update(&eye(), true);
            terrain.sync_tiles().unwrap();

            let cache = terrain.elevation_cache().unwrap();
            let cache = lock(&cache);
            readback.update(frame, &mut terrain.quadtree, &CpuElevationReducer::new(&cache));
        }

        // the height function x + 2y spans -3 to 3 over the root
        let root = terrain.quadtree.node(terrain.quadtree.root());
        assert!((root.zmin + 3.0).abs() < 1e-5);
        assert!((root.zmax - 3.0).abs() < 1e-5);
    }

    #[test]
    fn undersized_caches_disable_the_terrain() {
        let mut config = config(default());
        config.samplers[0].capacity = 2;

        let mut caches = TileCaches::default();
        let mut terrain = Terrain::new(&config, &sources(), &mut caches).unwrap();
        terrain.update(&eye(), true);

        let mut world = World::new();
        world.init_resource::<DebugTerrain>();
        let entity = world.spawn((terrain, config)).id();

        world.run_system_once(sync_terrain_tiles).unwrap();

        assert!(world.get::<Terrain>(entity).is_none());
        assert!(world.get::<TerrainConfig>(entity).is_none());

        // the tiles of the disabled terrain have been released
        let cache = caches.get(&"dem".to_string()).unwrap();
        assert_eq!(lock(&cache).unused_tiles(), lock(&cache).len());
    }

    #[test]
    fn dropped_terrains_release_their_tiles() {
        let mut caches = TileCaches::default();
        let mut terrain = Terrain::new(&config(default()), &sources(), &mut caches).unwrap();

        terrain.update(&eye(), true);
        terrain.sync_tiles().unwrap();

        let cache = terrain.samplers[0].cache().clone();
        let leased = terrain.samplers[0].tile_tree.lease_count();
        assert!(leased > 0);
        assert_eq!(lock(&cache).unused_tiles(), 0);

        drop(terrain);

        assert_eq!(lock(&cache).unused_tiles(), leased);
        assert_eq!(caches.remove_unused(), 0);
        drop(cache);
        assert_eq!(caches.remove_unused(), 1);
    }
}
