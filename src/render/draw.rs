use crate::terrain_data::{
    quadtree::{QuadKey, TerrainQuadtree},
    QuadCoordinate,
};
use bevy::log::trace;

/// The position of each child quarter in the index buffer of the quad mesh.
///
/// Quarters are stored as a ring in the order bottom left, bottom right, top right,
/// top left, so that any set of quarters spans at most two contiguous index ranges.
const RING_POSITION: [u32; 4] = [0, 1, 3, 2];

/// A contiguous range of the quad mesh index buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRange {
    pub first: u32,
    pub count: u32,
}

/// Builds the index buffer of a quad mesh with `grid_size` by `grid_size` cells.
///
/// The cells of each quarter are stored together, in the ring order of the
/// [`QuarterTable`]. Vertices are numbered row by row, `grid_size + 1` per row.
pub fn quad_mesh_indices(grid_size: u32) -> Vec<u32> {
    let half = grid_size / 2;
    let row = grid_size + 1;

    let mut quarters = [0, 1, 2, 3];
    quarters.sort_by_key(|&quarter| RING_POSITION[quarter]);

    let mut indices = Vec::with_capacity((6 * grid_size * grid_size) as usize);

    for quarter in quarters {
        let (qx, qy) = ((quarter % 2) as u32 * half, (quarter / 2) as u32 * half);

        for y in qy..qy + half {
            for x in qx..qx + half {
                let bottom_left = y * row + x;
                let bottom_right = bottom_left + 1;
                let top_left = bottom_left + row;
                let top_right = top_left + 1;

                indices.extend([
                    bottom_left,
                    bottom_right,
                    top_left,
                    top_left,
                    bottom_right,
                    top_right,
                ]);
            }
        }
    }

    indices
}

/// Maps the set of children drawn on their own to the index ranges the parent still
/// has to draw itself.
#[derive(Clone, Debug)]
pub struct QuarterTable {
    quarter_count: u32,
    ranges: [[Option<IndexRange>; 2]; 16],
}

impl QuarterTable {
    pub fn new(grid_size: u32) -> Self {
        let quarter_count = 6 * (grid_size / 2) * (grid_size / 2);

        let ranges = std::array::from_fn(|done| {
            let mut positions = (0..4)
                .filter(|&child| done & (1 << child) == 0)
                .map(|child| RING_POSITION[child])
                .collect::<Vec<_>>();
            positions.sort_unstable();

            let mut merged: Vec<IndexRange> = Vec::with_capacity(2);

            for position in positions {
                let first = position * quarter_count;

                match merged.last_mut() {
                    Some(last) if last.first + last.count == first => last.count += quarter_count,
                    _ => merged.push(IndexRange {
                        first,
                        count: quarter_count,
                    }),
                }
            }

            [merged.first().copied(), merged.get(1).copied()]
        });

        Self {
            quarter_count,
            ranges,
        }
    }

    /// The number of indices of a single quarter.
    pub fn quarter_count(&self) -> u32 {
        self.quarter_count
    }

    /// The number of indices of the whole mesh.
    pub fn index_count(&self) -> u32 {
        4 * self.quarter_count
    }

    /// The ranges covering the quarters whose bit in `done` is not set.
    pub fn ranges(&self, done: u8) -> [Option<IndexRange>; 2] {
        self.ranges[(done & 0b1111) as usize]
    }
}

/// Which parts of the quad mesh to draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawRanges {
    Full,
    /// Only the quarters whose children are not drawn on their own.
    Partial([Option<IndexRange>; 2]),
}

/// A quad to draw, with the data of its tiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawCommand {
    pub quad: QuadKey,
    pub coordinate: QuadCoordinate,
    pub ranges: DrawRanges,
}

/// Collects the quads to draw, nearest to the camera first.
#[derive(Clone, Debug)]
pub struct DrawTraversal {
    pub table: QuarterTable,
    /// Whether quads whose data is not ready yet are replaced by their parents.
    pub asynchronous: bool,
}

impl DrawTraversal {
    pub fn new(grid_size: u32, asynchronous: bool) -> Self {
        Self {
            table: QuarterTable::new(grid_size),
            asynchronous,
        }
    }

    pub fn collect(&self, quadtree: &TerrainQuadtree) -> Vec<DrawCommand> {
        let mut commands = Vec::new();

        self.draw_quad(quadtree, quadtree.root(), &mut commands);

        trace!("Collected {} terrain draw commands.", commands.len());

        commands
    }

    fn draw_quad(&self, quadtree: &TerrainQuadtree, key: QuadKey, commands: &mut Vec<DrawCommand>) {
        let quad = quadtree.node(key);

        if !quad.is_visible() || (self.asynchronous && !quad.drawable) {
            return;
        }

        let Some(children) = quad.children else {
            commands.push(DrawCommand {
                quad: key,
                coordinate: quad.coordinate,
                ranges: DrawRanges::Full,
            });
            return;
        };

        let mut done = 0u8;

        for index in quadtree.child_order(key) {
            let child = quadtree.node(children[index]);

            if !child.is_visible() {
                done |= 1 << index;
            } else if !self.asynchronous || child.drawable {
                self.draw_quad(quadtree, children[index], commands);
                done |= 1 << index;
            }
        }

        if done != 0b1111 {
            commands.push(DrawCommand {
                quad: key,
                coordinate: quad.coordinate,
                ranges: DrawRanges::Partial(self.table.ranges(done)),
            });
        }
    }
}
