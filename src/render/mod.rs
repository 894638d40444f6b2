//! This module contains everything between the terrain data and the GPU.
//!
//! The [`ReadbackManager`](readback::ReadbackManager) pulls values computed on the GPU back
//! with a fixed latency, which the [`ElevationReadback`](elevation::ElevationReadback) uses
//! to keep the elevation bounds of the quadtree up to date.
//! The [`DrawTraversal`](draw::DrawTraversal) then collects the quads to draw, and the
//! uniforms describe them to the shaders.

pub mod draw;
pub mod elevation;
pub mod readback;
pub mod uniforms;
