//! Actor slots, bounding boxes and the per-slot validity mask.
//!
//! Every clip carries a fixed number of actor slots (`capacity`). Slots
//! without a detected actor hold NaN boxes. The [`ValidityMask`] records
//! which slots are real; everything downstream reads only those.

use crate::config::ImageSize;
use crate::error::DcmError;

/// One box as `[x1, y1, x2, y2]` in image pixels.
pub type BoxCoords = [f32; 4];

/// Bounding boxes of one batch, `batch × capacity` slots.
///
/// # Example
///
/// ```
/// use dcm_core::ActorBoxes;
///
/// let nan = f32::NAN;
/// let flat = vec![
///     0.0, 0.0, 8.0, 8.0,   // clip 0, slot 0
///     nan, nan, nan, nan,   // clip 0, slot 1 (padding)
/// ];
/// let boxes = ActorBoxes::from_flat(&flat, 1, 2).unwrap();
/// let mask = boxes.validity();
/// assert!(mask.is_valid(0, 0));
/// assert!(!mask.is_valid(0, 1));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ActorBoxes {
    batch: usize,
    capacity: usize,
    coords: Vec<BoxCoords>,
}

impl ActorBoxes {
    /// Builds from a flat `[batch, capacity, 2, 2]` buffer, corner-major
    /// (`x1, y1, x2, y2` per slot).
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::ShapeMismatch`] if the buffer length is not
    /// `batch * capacity * 4`.
    pub fn from_flat(data: &[f32], batch: usize, capacity: usize) -> Result<Self, DcmError> {
        let expected = batch * capacity * 4;
        if data.len() != expected {
            return Err(DcmError::shape(
                "bounding boxes",
                format!("{expected} values ([{batch}, {capacity}, 2, 2])"),
                format!("{} values", data.len()),
            ));
        }
        let coords = data
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .collect();
        Ok(Self {
            batch,
            capacity,
            coords,
        })
    }

    /// Number of clips.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Slots per clip.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Box of clip `b`, slot `s`.
    pub fn get(&self, b: usize, s: usize) -> BoxCoords {
        self.coords[b * self.capacity + s]
    }

    /// All boxes in `(clip, slot)` order.
    pub fn iter(&self) -> impl Iterator<Item = &BoxCoords> {
        self.coords.iter()
    }

    /// A slot is valid when none of its coordinates is NaN.
    pub fn validity(&self) -> ValidityMask {
        ValidityMask {
            batch: self.batch,
            capacity: self.capacity,
            valid: self
                .coords
                .iter()
                .map(|c| !c.iter().any(|v| v.is_nan()))
                .collect(),
        }
    }

    /// Copy with every NaN coordinate replaced by zero.
    ///
    /// Padded slots then pool a degenerate but finite region, which keeps
    /// the batch rectangular; the mask discards the result afterwards.
    pub fn sanitized(&self) -> Self {
        Self {
            batch: self.batch,
            capacity: self.capacity,
            coords: self
                .coords
                .iter()
                .map(|c| c.map(|v| if v.is_nan() { 0.0 } else { v }))
                .collect(),
        }
    }

    /// Scalar spatial feature per slot: the Euclidean norm of the box
    /// centre with both axes normalised by the image size. Padded slots
    /// get zero.
    ///
    /// # Example
    ///
    /// ```
    /// use dcm_core::{ActorBoxes, ImageSize};
    ///
    /// let boxes = ActorBoxes::from_flat(&[0.0, 0.0, 64.0, 0.0], 1, 1).unwrap();
    /// let norms = boxes.spatial_norms(ImageSize { width: 64, height: 32 });
    /// assert!((norms[0] - 0.5).abs() < 1e-6);
    /// ```
    pub fn spatial_norms(&self, image: ImageSize) -> Vec<f32> {
        let (w, h) = (image.width as f32, image.height as f32);
        self.coords
            .iter()
            .map(|c| {
                if c.iter().any(|v| v.is_nan()) {
                    return 0.0;
                }
                let cx = (c[0] + c[2]) * 0.5 / w;
                let cy = (c[1] + c[3]) * 0.5 / h;
                (cx * cx + cy * cy).sqrt()
            })
            .collect()
    }
}

/// Per-slot validity flags of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityMask {
    batch: usize,
    capacity: usize,
    valid: Vec<bool>,
}

impl ValidityMask {
    /// Builds from explicit flags in `(clip, slot)` order.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::ShapeMismatch`] if `valid.len() != batch * capacity`.
    pub fn from_flags(valid: Vec<bool>, batch: usize, capacity: usize) -> Result<Self, DcmError> {
        if valid.len() != batch * capacity {
            return Err(DcmError::shape(
                "validity mask",
                batch * capacity,
                valid.len(),
            ));
        }
        Ok(Self {
            batch,
            capacity,
            valid,
        })
    }

    /// Number of clips.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Slots per clip.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether clip `b`, slot `s` holds an actor.
    pub fn is_valid(&self, b: usize, s: usize) -> bool {
        self.valid[b * self.capacity + s]
    }

    /// Valid slot indices of clip `b`, ascending.
    pub fn valid_slots(&self, b: usize) -> Vec<usize> {
        (0..self.capacity).filter(|&s| self.is_valid(b, s)).collect()
    }

    /// Number of valid slots in clip `b`.
    pub fn count(&self, b: usize) -> usize {
        self.valid[b * self.capacity..(b + 1) * self.capacity]
            .iter()
            .filter(|&&v| v)
            .count()
    }

    /// Total number of valid slots in the batch.
    pub fn total(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Flat `(clip * capacity + slot)` positions of all valid slots,
    /// ascending. Rows of one clip are therefore contiguous.
    pub fn flat_indices(&self) -> Vec<u32> {
        self.valid
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Flags as `1.0` / `0.0` in `(clip, slot)` order.
    pub fn as_f32(&self) -> Vec<f32> {
        self.valid.iter().map(|&v| if v { 1.0 } else { 0.0 }).collect()
    }
}
