use crate::{
    error::{TerrainError, TerrainResult},
    terrain_data::{
        quadtree::{QuadKey, QuadNode, TerrainQuadtree},
        task::TaskGraph,
        tile_cache::{TileFlags, TileLease, TileProducer},
        QuadCoordinate,
    },
};
use bevy::{
    log::{error, trace},
    math::DVec2,
};
use serde::{Deserialize, Serialize};
use slab::Slab;

/// The index of a [`TileTreeNode`] inside the arena of its [`TileTreeSync`].
pub type TileKey = usize;

/// Decides which quads of the terrain need their own tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerPolicy {
    /// Whether leaf quads need a tile.
    pub store_leaf: bool,
    /// Whether internal quads need a tile, even if their children have one.
    pub store_parent: bool,
    /// Whether invisible quads need a tile.
    pub store_invisible: bool,
    /// Whether tiles are acquired without blocking, using the tiles of ancestors until
    /// their own is ready. Requires `store_parent`.
    pub asynchronous: bool,
    /// Whether the tile of the parent is provided as well, so that both can be blended.
    pub mipmap: bool,
    /// Whether tiles acquired synchronously are produced right away.
    pub produce_synchronously: bool,
}

impl Default for SamplerPolicy {
    fn default() -> Self {
        Self {
            store_leaf: true,
            store_parent: true,
            store_invisible: false,
            asynchronous: false,
            mipmap: false,
            produce_synchronously: false,
        }
    }
}

/// Forces quads to store a tile, independent of the [`SamplerPolicy`].
pub trait TileFilter: Send + Sync {
    fn store_tile(&self, quad: &QuadNode) -> bool;
}

impl<F> TileFilter for F
where
    F: Fn(&QuadNode) -> bool + Send + Sync,
{
    fn store_tile(&self, quad: &QuadNode) -> bool {
        self(quad)
    }
}

/// A node of the [`TileTreeSync`], mirroring a quad of the [`TerrainQuadtree`].
#[derive(Debug)]
pub struct TileTreeNode {
    pub coordinate: QuadCoordinate,
    pub parent: Option<TileKey>,
    /// The children in the order of the quad children. Only children whose tile exists
    /// are materialized.
    pub children: [Option<TileKey>; 4],
    /// The lease on the tile of this node, only held while `need_tile` is set.
    pub lease: Option<TileLease>,
    pub need_tile: bool,
    /// The children of this node already requested for prefetching.
    pub prefetched: u8,
}

impl TileTreeNode {
    fn new(coordinate: QuadCoordinate, parent: Option<TileKey>, need_tile: bool) -> Self {
        Self {
            coordinate,
            parent,
            children: [None; 4],
            lease: None,
            need_tile,
            prefetched: 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }
}

/// The location of a quad inside a leased tile.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileCoords {
    /// The coordinate of the leased tile, which may be an ancestor of the quad.
    pub coordinate: QuadCoordinate,
    /// The slot of the leased tile inside the cache.
    pub slot: u32,
    /// The lower left corner of the quad inside the tile, in uv coordinates.
    pub offset: DVec2,
    /// The size of the quad inside the tile, in uv coordinates.
    pub scale: f64,
}

impl TileCoords {
    fn new(quad: QuadCoordinate, lease: &TileLease) -> Self {
        let tile = lease.coordinate();
        let depth = quad.level - tile.level;
        let count = QuadCoordinate::count(depth);
        let scale = 1.0 / count as f64;

        Self {
            coordinate: tile,
            slot: lease.slot(),
            offset: DVec2::new((quad.tx % count) as f64, (quad.ty % count) as f64) * scale,
            scale,
        }
    }
}

/// The best available data for a quad.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TileLookup {
    pub tile: TileCoords,
    /// The next coarser tile, provided for blending if the sampler uses mipmapping.
    pub parent: Option<TileCoords>,
}

/// Mirrors the shape of a [`TerrainQuadtree`] and keeps the tiles its quads require
/// leased from a [`TileProducer`].
///
/// Each frame, [`TileTreeSync::put_tiles`] first releases the tiles which are no longer
/// required and [`TileTreeSync::get_tiles`] then acquires the missing ones.
/// Samplers that are asynchronous never block on missing tiles. Instead they prefetch
/// them and fall back to the tiles of ancestors in the meantime.
pub struct TileTreeSync {
    name: String,
    policy: SamplerPolicy,
    filters: Vec<Box<dyn TileFilter>>,
    nodes: Slab<TileTreeNode>,
    root: Option<TileKey>,
}

impl TileTreeSync {
    pub fn new(name: impl Into<String>, policy: SamplerPolicy) -> TerrainResult<Self> {
        let name = name.into();

        if policy.asynchronous && !policy.store_parent {
            return Err(TerrainError::InvalidPolicy(name));
        }

        Ok(Self {
            name,
            policy,
            filters: Vec::new(),
            nodes: Slab::new(),
            root: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &SamplerPolicy {
        &self.policy
    }

    pub fn add_filter(&mut self, filter: impl TileFilter + 'static) {
        self.filters.push(Box::new(filter));
    }

    pub fn root(&self) -> Option<TileKey> {
        self.root
    }

    pub fn node(&self, key: TileKey) -> &TileTreeNode {
        &self.nodes[key]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (TileKey, &TileTreeNode)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The number of leases currently held.
    pub fn lease_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|(_, node)| node.lease.is_some())
            .count()
    }

    /// Looks up the materialized node mirroring the quad with the given coordinate.
    pub fn find(&self, coordinate: QuadCoordinate) -> Option<TileKey> {
        let mut key = self.root?;

        for depth in (0..coordinate.level).rev() {
            key = self.nodes[key].children[coordinate.ancestor(depth).child_index()]?;
        }

        Some(key)
    }

    fn need_tile(&self, quad: &QuadNode, producer: &dyn TileProducer) -> bool {
        let mut need_tile = self.policy.store_leaf;

        if !self.policy.store_parent && !quad.is_leaf() && producer.has_children(quad.coordinate)
        {
            need_tile = false;
        }

        if !need_tile {
            need_tile = self.filters.iter().any(|filter| filter.store_tile(quad));
        }

        if !self.policy.store_invisible && !quad.is_visible() {
            need_tile = false;
        }

        need_tile
    }

    /// Synchronizes the tree with the quadtree: releases the tiles no longer required,
    /// then acquires the missing ones.
    ///
    /// Productions that are not done yet are added to `graph`.
    pub fn update(
        &mut self,
        quadtree: &TerrainQuadtree,
        producer: &mut dyn TileProducer,
        graph: &mut TaskGraph,
    ) -> TerrainResult<()> {
        self.put_tiles(quadtree, producer);
        self.get_tiles(quadtree, producer, graph)?;

        trace!(
            "Sampler '{}' holds {} leases for {} nodes.",
            self.name,
            self.lease_count(),
            self.nodes.len()
        );

        Ok(())
    }

    /// Recomputes which nodes need a tile and releases the leases no longer required,
    /// including all leases below quads that have been merged.
    pub fn put_tiles(&mut self, quadtree: &TerrainQuadtree, producer: &mut dyn TileProducer) {
        if let Some(root) = self.root {
            self.put_tiles_recursive(root, quadtree.root(), quadtree, producer);
        }
    }

    fn put_tiles_recursive(
        &mut self,
        key: TileKey,
        quad_key: QuadKey,
        quadtree: &TerrainQuadtree,
        producer: &mut dyn TileProducer,
    ) {
        let quad = quadtree.node(quad_key);
        let need_tile = self.need_tile(quad, producer);

        let node = &mut self.nodes[key];
        node.need_tile = need_tile;

        if !need_tile {
            if let Some(lease) = node.lease.take() {
                producer.put_tile(lease);
            }
        }

        match quad.children {
            None => {
                let children = std::mem::take(&mut self.nodes[key].children);

                for child in children.into_iter().flatten() {
                    self.remove_subtree(child, producer);
                }
            }
            Some(quad_children) if producer.has_children(quad.coordinate) => {
                for (index, quad_child) in quad_children.into_iter().enumerate() {
                    if let Some(child) = self.nodes[key].children[index] {
                        self.put_tiles_recursive(child, quad_child, quadtree, producer);
                    }
                }
            }
            Some(_) => {}
        }
    }

    fn remove_subtree(&mut self, key: TileKey, producer: &mut dyn TileProducer) {
        let node = self.nodes.remove(key);

        if let Some(lease) = node.lease {
            producer.put_tile(lease);
        }

        for child in node.children.into_iter().flatten() {
            self.remove_subtree(child, producer);
        }
    }

    /// Materializes missing nodes and acquires the tiles they need.
    ///
    /// Fails if a tile has to be acquired synchronously, but the producer has no room
    /// left for it.
    pub fn get_tiles(
        &mut self,
        quadtree: &TerrainQuadtree,
        producer: &mut dyn TileProducer,
        graph: &mut TaskGraph,
    ) -> TerrainResult<()> {
        let quad_root = quadtree.root();

        let root = match self.root {
            Some(root) => root,
            None => {
                let quad = quadtree.node(quad_root);

                if !producer.has_tile(quad.coordinate) {
                    return Ok(());
                }

                let need_tile = self.need_tile(quad, producer);
                let root = self.nodes.insert(TileTreeNode::new(quad.coordinate, None, need_tile));
                self.root = Some(root);
                root
            }
        };

        self.get_tiles_recursive(root, quad_root, quadtree, producer, graph)
    }

    fn get_tiles_recursive(
        &mut self,
        key: TileKey,
        quad_key: QuadKey,
        quadtree: &TerrainQuadtree,
        producer: &mut dyn TileProducer,
        graph: &mut TaskGraph,
    ) -> TerrainResult<()> {
        let quad = quadtree.node(quad_key);
        let coordinate = quad.coordinate;
        let node = &mut self.nodes[key];

        debug_assert_eq!(node.coordinate, coordinate);

        if node.need_tile && node.lease.is_none() {
            // the root is always acquired synchronously, so that there is a fallback
            if self.policy.asynchronous && coordinate.level > 0 {
                node.lease = producer.find_tile(coordinate, true);

                if node.lease.is_none() {
                    producer.prefetch_tile(coordinate);
                }
            } else {
                let flags = if self.policy.produce_synchronously {
                    TileFlags::PRODUCE_NOW
                } else {
                    TileFlags::empty()
                };

                match producer.get_tile(coordinate, flags) {
                    Some(lease) => node.lease = Some(lease),
                    None => {
                        error!("Insufficient tile cache size for '{}'.", self.name);

                        return Err(TerrainError::InsufficientCache {
                            sampler: self.name.clone(),
                            coordinate,
                        });
                    }
                }
            }
        }

        let node = &self.nodes[key];

        if let Some(lease) = &node.lease {
            let (task, status) = producer.production(lease);

            if !status.is_done() {
                graph.add_task(task, format!("{}/{coordinate}", self.name));

                // mipmapped tiles are blended with the tile of their parent
                let parent = node.parent.and_then(|parent| self.nodes[parent].lease.as_ref());

                if let Some(parent) = parent.filter(|_| self.policy.mipmap) {
                    graph.add_dependency(task, producer.production(parent).0);
                }
            }
        }

        let Some(quad_children) = quad.children else {
            return Ok(());
        };

        if !producer.has_children(coordinate) {
            return Ok(());
        }

        for (index, quad_child) in quad_children.into_iter().enumerate() {
            let child = match self.nodes[key].children[index] {
                Some(child) => child,
                None => {
                    let quad = quadtree.node(quad_child);

                    if !producer.has_tile(quad.coordinate) {
                        continue;
                    }

                    let need_tile = self.need_tile(quad, producer);
                    let child = self
                        .nodes
                        .insert(TileTreeNode::new(quad.coordinate, Some(key), need_tile));
                    self.nodes[key].children[index] = Some(child);
                    child
                }
            };

            self.get_tiles_recursive(child, quad_child, quadtree, producer, graph)?;
        }

        Ok(())
    }

    /// Marks the quads that can be drawn neither with their own data nor with the data
    /// of all of their children as not drawable.
    ///
    /// Quads without a node, as well as invisible quads, are considered ready.
    /// Synchronous samplers always have their data ready, and mipmapped samplers blend
    /// the data of the parent until their own is ready, so neither restricts drawing.
    pub fn mark_drawable(&self, quadtree: &mut TerrainQuadtree, producer: &dyn TileProducer) {
        if self.policy.mipmap || !self.policy.asynchronous {
            return;
        }

        if let Some(root) = self.root {
            let quad_root = quadtree.root();
            self.mark_drawable_recursive(root, quad_root, quadtree, producer);
        }
    }

    /// Returns whether the quad is drawable.
    fn mark_drawable_recursive(
        &self,
        key: TileKey,
        quad_key: QuadKey,
        quadtree: &mut TerrainQuadtree,
        producer: &dyn TileProducer,
    ) -> bool {
        let node = &self.nodes[key];
        let mut children_drawable = false;

        if let Some(quad_children) = quadtree.node(quad_key).children {
            let mut drawable = 0;

            for (index, quad_child) in quad_children.into_iter().enumerate() {
                let child_drawable = match node.children[index] {
                    Some(child) => {
                        self.mark_drawable_recursive(child, quad_child, quadtree, producer)
                    }
                    None => quadtree.node(quad_child).drawable,
                };

                if child_drawable {
                    drawable += 1;
                }
            }

            children_drawable = drawable == 4;
        }

        let quad = quadtree.node_mut(quad_key);

        let ready = !quad.is_visible()
            || !node.need_tile
            || node
                .lease
                .as_ref()
                .is_some_and(|lease| producer.production(lease).1.is_done());

        quad.drawable &= ready || children_drawable;
        quad.drawable
    }

    /// Requests the tiles one level below the current leaves ahead of their use,
    /// in child order, until `quota` requests have been issued.
    ///
    /// Returns the number of issued requests.
    pub fn prefetch(
        &mut self,
        quadtree: &TerrainQuadtree,
        producer: &mut dyn TileProducer,
        quota: usize,
    ) -> usize {
        let mut issued = 0;

        if let Some(root) = self.root {
            self.prefetch_recursive(root, quadtree.root(), quadtree, producer, quota, &mut issued);
        }

        issued
    }

    fn prefetch_recursive(
        &mut self,
        key: TileKey,
        quad_key: QuadKey,
        quadtree: &TerrainQuadtree,
        producer: &mut dyn TileProducer,
        quota: usize,
        issued: &mut usize,
    ) {
        if *issued >= quota {
            return;
        }

        let quad = quadtree.node(quad_key);

        let Some(quad_children) = quad.children else {
            let coordinate = quad.coordinate;

            if !quad.is_visible() || !producer.has_children(coordinate) {
                return;
            }

            let node = &mut self.nodes[key];

            for (index, child) in coordinate.children().enumerate() {
                if *issued >= quota {
                    break;
                }

                if node.prefetched & (1 << index) != 0 {
                    if producer.is_resident(child) {
                        continue;
                    }

                    // evicted before it was used
                    node.prefetched &= !(1 << index);
                }

                if producer.prefetch_tile(child) {
                    node.prefetched |= 1 << index;
                    *issued += 1;
                }
            }

            return;
        };

        for (index, quad_child) in quad_children.into_iter().enumerate() {
            if let Some(child) = self.nodes[key].children[index] {
                self.prefetch_recursive(child, quad_child, quadtree, producer, quota, issued);
            }
        }
    }

    /// Finds the best ready tile for the quad with the given coordinate: its own tile,
    /// or otherwise the tile of its nearest ancestor.
    pub fn lookup(
        &self,
        producer: &dyn TileProducer,
        coordinate: QuadCoordinate,
    ) -> Option<TileLookup> {
        let mut key = self.root?;
        let mut ready = Vec::new();

        for depth in (0..=coordinate.level).rev() {
            if depth < coordinate.level {
                match self.nodes[key].children[coordinate.ancestor(depth).child_index()] {
                    Some(child) => key = child,
                    None => break,
                }
            }

            if let Some(lease) = &self.nodes[key].lease {
                if producer.production(lease).1.is_done() {
                    ready.push(lease);
                }
            }
        }

        let mut ready = ready.into_iter().rev();
        let tile = TileCoords::new(coordinate, ready.next()?);
        let parent = self
            .policy
            .mipmap
            .then(|| ready.next().map(|lease| TileCoords::new(coordinate, lease)))
            .flatten();

        Some(TileLookup { tile, parent })
    }

    /// Releases all leases and clears the tree.
    pub fn release_all(&mut self, producer: &mut dyn TileProducer) {
        if let Some(root) = self.root.take() {
            self.remove_subtree(root, producer);
        }
    }
}
