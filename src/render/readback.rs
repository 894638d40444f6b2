use crate::error::{TerrainError, TerrainResult};
use bevy::{log::debug, utils::HashMap};

/// Copies bytes from the GPU into host visible staging buffers.
///
/// Each transfer is identified by the batch it was started in and its index within
/// that batch. A transfer is always finished exactly once, after it was started.
pub trait ReadbackBackend {
    /// Starts copying `source` into the staging buffer `index` of `batch`.
    fn start(&mut self, batch: usize, index: usize, source: &[u8]);

    /// Completes the transfer and returns the staged bytes.
    fn finish(&mut self, batch: usize, index: usize) -> Vec<u8>;
}

/// A [`ReadbackBackend`] which stages the bytes in memory.
#[derive(Debug, Default)]
pub struct CpuReadbackBackend {
    staging: HashMap<(usize, usize), Vec<u8>>,
}

impl CpuReadbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of transfers started but not finished yet.
    pub fn in_flight(&self) -> usize {
        self.staging.len()
    }
}

impl ReadbackBackend for CpuReadbackBackend {
    fn start(&mut self, batch: usize, index: usize, source: &[u8]) {
        self.staging.insert((batch, index), source.to_vec());
    }

    fn finish(&mut self, batch: usize, index: usize) -> Vec<u8> {
        self.staging.remove(&(batch, index)).unwrap_or_default()
    }
}

/// The continuation invoked with the bytes of a finished readback.
pub type ReadbackCallback<C> = Box<dyn FnOnce(&mut C, &[u8]) + Send + Sync>;

/// Transfers data from the GPU to the CPU with a fixed latency, without ever blocking.
///
/// Readbacks started during a frame are delivered by the [`ReadbackManager::new_frame`]
/// call `delay` frames later. The batches form a ring, so each call of `new_frame`
/// finishes the oldest batch and reuses its slot for the readbacks of the new frame.
pub struct ReadbackManager<B, C> {
    backend: B,
    max_per_frame: usize,
    batches: Vec<Vec<ReadbackCallback<C>>>,
    current: usize,
}

impl<B: ReadbackBackend, C> ReadbackManager<B, C> {
    pub fn new(backend: B, max_per_frame: usize, delay: usize) -> TerrainResult<Self> {
        if max_per_frame == 0 {
            return Err(TerrainError::InvalidConfig(
                "at least one readback per frame is required".into(),
            ));
        }

        if delay == 0 {
            return Err(TerrainError::InvalidConfig(
                "the readback delay has to be at least one frame".into(),
            ));
        }

        Ok(Self {
            backend,
            max_per_frame,
            batches: (0..delay).map(|_| Vec::with_capacity(max_per_frame)).collect(),
            current: 0,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn max_per_frame(&self) -> usize {
        self.max_per_frame
    }

    /// The number of frames between starting a readback and receiving its result.
    pub fn delay(&self) -> usize {
        self.batches.len()
    }

    /// The number of readbacks started but not delivered yet.
    pub fn in_flight(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Whether another readback may be started during this frame.
    pub fn can_readback(&self) -> bool {
        self.batches[self.current].len() < self.max_per_frame
    }

    /// Starts reading back `source`. Returns false, without invoking the callback, if
    /// the limit of readbacks for this frame has been reached.
    pub fn readback(
        &mut self,
        source: &[u8],
        callback: impl FnOnce(&mut C, &[u8]) + Send + Sync + 'static,
    ) -> bool {
        if !self.can_readback() {
            return false;
        }

        let batch = &mut self.batches[self.current];
        self.backend.start(self.current, batch.len(), source);
        batch.push(Box::new(callback));

        true
    }

    /// Advances to the next frame, delivering the readbacks started `delay` frames ago.
    ///
    /// Returns the number of invoked callbacks.
    pub fn new_frame(&mut self, context: &mut C) -> usize {
        self.current = (self.current + 1) % self.batches.len();

        let callbacks = std::mem::take(&mut self.batches[self.current]);
        let count = callbacks.len();

        for (index, callback) in callbacks.into_iter().enumerate() {
            let data = self.backend.finish(self.current, index);
            callback(context, &data);
        }

        if count > 0 {
            debug!("Delivered {count} readbacks.");
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Frames {
        current: u32,
        delivered: Vec<(u32, u32)>,
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(ReadbackManager::<_, ()>::new(CpuReadbackBackend::new(), 0, 3).is_err());
        assert!(ReadbackManager::<_, ()>::new(CpuReadbackBackend::new(), 2, 0).is_err());
    }

    #[test]
    fn readbacks_are_delivered_after_the_delay() {
        let mut manager = ReadbackManager::new(CpuReadbackBackend::new(), 2, 3).unwrap();
        let mut frames = Frames::default();

        for frame in 0..12 {
            frames.current = frame;
            let delivered = manager.new_frame(&mut frames);

            assert_eq!(delivered, if frame >= 3 { 2 } else { 0 });

            let mut started = 0;

            for _ in 0..3 {
                let accepted = manager.readback(&frame.to_le_bytes(), |frames: &mut Frames, data| {
                    let started = bytemuck::pod_read_unaligned::<u32>(data);
                    frames.delivered.push((started, frames.current));
                });

                started += usize::from(accepted);
            }

            assert_eq!(started, 2);
            assert!(!manager.can_readback());
            assert!(manager.in_flight() <= 2 * 3);
        }

        assert_eq!(frames.delivered.len(), 2 * 9);
        assert!(frames
            .delivered
            .iter()
            .all(|&(started, delivered)| delivered == started + 3));
        assert_eq!(manager.backend().in_flight(), manager.in_flight());
    }

    #[test]
    fn single_frame_delay_delivers_on_the_next_frame() {
        let mut manager = ReadbackManager::new(CpuReadbackBackend::new(), 1, 1).unwrap();
        let mut values = Vec::new();

        manager.new_frame(&mut values);
        assert!(manager.readback(&[7], |values: &mut Vec<u8>, data| values.extend_from_slice(data)));
        assert!(values.is_empty());

        assert_eq!(manager.new_frame(&mut values), 1);
        assert_eq!(values, vec![7]);
        assert_eq!(manager.new_frame(&mut values), 0);
    }
}
