//! Deterministic synthetic clips for smoke training and tests.
//!
//! Each actor is a coloured rectangle drifting at constant velocity over a
//! dark background. The flow channels carry that velocity inside the
//! rectangle. Boxes describe the last frame. Every clip draws its actor
//! count uniformly from `0..=capacity`, so empty clips occur.

use candle_core::{Device, Tensor};
use dcm_core::{DcmConfig, DcmError, ImageSize, SimpleRng};
use dcm_nn::ActorBatch;

use crate::fit::BatchSource;

const BACKGROUND: f32 = -0.8;
const NOISE: f32 = 0.05;
const MAX_SPEED: f32 = 2.0;

struct Actor {
    corners: [f32; 4],
    color: [f32; 3],
    velocity: (f32, f32),
}

/// Synthetic dataset with the loader's batch layout.
#[derive(Debug, Clone)]
pub struct SyntheticClips {
    n_clips: usize,
    capacity: usize,
    clip_len: usize,
    batch_size: usize,
    image: ImageSize,
    seed: u64,
}

impl SyntheticClips {
    /// `n_clips` clips of `clip_len` frames at the configured image size,
    /// served `batch_size` clips at a time.
    pub fn new(
        config: &DcmConfig,
        n_clips: usize,
        capacity: usize,
        clip_len: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            n_clips,
            capacity,
            clip_len: clip_len.max(1),
            batch_size: batch_size.max(1),
            image: config.image,
            seed: config.seed,
        }
    }

    /// Clips per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn clip_rng(&self, clip: usize) -> SimpleRng {
        SimpleRng::new(self.seed ^ (clip as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15))
    }

    fn actors(&self, rng: &mut SimpleRng) -> Vec<Actor> {
        let (w, h) = (self.image.width as f32, self.image.height as f32);
        let count = rng.next_below(self.capacity + 1);
        (0..count)
            .map(|_| {
                let bw = rng.next_f32_range(w / 8.0, w / 3.0);
                let bh = rng.next_f32_range(h / 6.0, h / 2.0);
                let x0 = rng.next_f32_range(0.0, w - bw);
                let y0 = rng.next_f32_range(0.0, h - bh);
                Actor {
                    corners: [x0, y0, x0 + bw, y0 + bh],
                    color: [0; 3].map(|_| rng.next_f32_range(-0.2, 1.0)),
                    velocity: (
                        rng.next_f32_range(-MAX_SPEED, MAX_SPEED),
                        rng.next_f32_range(-MAX_SPEED, MAX_SPEED),
                    ),
                }
            })
            .collect()
    }

    /// Number of real actors in `clip`.
    pub fn actor_count(&self, clip: usize) -> usize {
        self.actors(&mut self.clip_rng(clip)).len()
    }

    /// Builds the batch of clips `start..start + len`.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::SampleOutOfRange`] if the range passes the last
    /// clip and [`DcmError::Internal`] on tensor failures.
    pub fn batch(&self, start: usize, len: usize, device: &Device) -> Result<ActorBatch, DcmError> {
        if start + len > self.n_clips {
            return Err(DcmError::SampleOutOfRange {
                index: start + len - 1,
                max: self.n_clips,
            });
        }
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("SyntheticClips::batch: {e}"),
        };
        let (w, h, t) = (self.image.width, self.image.height, self.clip_len);
        let plane = w * h;
        let mut frames = Vec::with_capacity(len * 3 * t * plane);
        let mut flows = vec![0f32; len * 2 * t * plane];
        let mut boxes = Vec::with_capacity(len * self.capacity * 4);

        for (b, clip) in (start..start + len).enumerate() {
            let mut rng = self.clip_rng(clip);
            let actors = self.actors(&mut rng);
            let base = frames.len();
            frames.extend((0..3 * t * plane).map(|_| BACKGROUND + NOISE * rng.next_normal()));

            for actor in &actors {
                for step in 0..t {
                    // boxes describe the last frame
                    let back = (t - 1 - step) as f32;
                    let dx = -actor.velocity.0 * back;
                    let dy = -actor.velocity.1 * back;
                    let x0 = (actor.corners[0] + dx).max(0.0) as usize;
                    let y0 = (actor.corners[1] + dy).max(0.0) as usize;
                    let x1 = ((actor.corners[2] + dx).max(0.0) as usize).min(w);
                    let y1 = ((actor.corners[3] + dy).max(0.0) as usize).min(h);
                    for y in y0..y1 {
                        for x in x0..x1 {
                            let px = y * w + x;
                            for (c, &value) in actor.color.iter().enumerate() {
                                frames[base + (c * t + step) * plane + px] = value;
                            }
                            let flow_base = b * 2 * t * plane;
                            flows[flow_base + step * plane + px] = actor.velocity.0 / MAX_SPEED;
                            flows[flow_base + (t + step) * plane + px] =
                                actor.velocity.1 / MAX_SPEED;
                        }
                    }
                }
            }

            for slot in 0..self.capacity {
                match actors.get(slot) {
                    Some(actor) => boxes.extend_from_slice(&actor.corners),
                    None => boxes.extend_from_slice(&[f32::NAN; 4]),
                }
            }
        }

        let frames = Tensor::from_vec(frames, (len, 3, t, h, w), device).map_err(map_err)?;
        let flows = Tensor::from_vec(flows, (len, 2, t, h, w), device).map_err(map_err)?;
        let boxes =
            Tensor::from_vec(boxes, (len, self.capacity, 2, 2), device).map_err(map_err)?;
        ActorBatch::new(frames, flows, boxes, (start..start + len).collect())
    }
}

impl BatchSource for SyntheticClips {
    fn n_clips(&self) -> usize {
        self.n_clips
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn epoch_batches(
        &mut self,
        _epoch: usize,
        device: &Device,
    ) -> Result<Vec<ActorBatch>, DcmError> {
        (0..self.n_clips)
            .step_by(self.batch_size)
            .map(|start| {
                let len = self.batch_size.min(self.n_clips - start);
                self.batch(start, len, device)
            })
            .collect()
    }
}
