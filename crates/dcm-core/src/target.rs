//! The self-training target distribution.
//!
//! A dense `N × K` matrix, one row per actor slot of the whole dataset. Row
//! `offset · capacity + slot` belongs to slot `slot` of the clip with global
//! offset `offset`. Rows start at zero and are rewritten only for the slots
//! present in a batch, only when the trainer asks for a refresh.
//!
//! Refresh of one clip with valid slots `i` and soft assignment `s`:
//!
//! ```text
//! f_j  = Σ_i s_ij                 soft cluster frequency
//! t_ij = s_ij² / f_j              sharpened
//! t_i  = t_i / Σ_j t_ij           renormalised
//! ```
//!
//! Clusters with `f_j == 0` contribute zero; rows whose raw target sums to
//! zero (or is not finite) are skipped and keep their previous value.

use tracing::warn;

use crate::error::DcmError;
use crate::mask::ValidityMask;

/// Owned `N × K` target matrix.
///
/// # Example
///
/// ```
/// use dcm_core::{TargetDistribution, ValidityMask};
///
/// let mut target = TargetDistribution::new(2, 2, 3).unwrap();
/// let mask = ValidityMask::from_flags(vec![true, false], 1, 2).unwrap();
/// let s = [0.0, 1.0, 0.0, /* padded */ 0.0, 0.0, 0.0];
/// target.update(&s, &mask, &[1]).unwrap();
/// assert_eq!(target.row(2), &[0.0, 1.0, 0.0]);
/// assert!(!target.is_written(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDistribution {
    n_rows: usize,
    capacity: usize,
    n_clusters: usize,
    data: Vec<f32>,
    written: Vec<bool>,
}

impl TargetDistribution {
    /// Creates a zero matrix for `n_clips` clips of `capacity` slots each.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Config`] if any size is zero.
    pub fn new(n_clips: usize, capacity: usize, n_clusters: usize) -> Result<Self, DcmError> {
        if n_clips == 0 || capacity == 0 || n_clusters == 0 {
            return Err(DcmError::config(format!(
                "target distribution needs non-zero sizes (clips={n_clips}, capacity={capacity}, clusters={n_clusters})"
            )));
        }
        let n_rows = n_clips
            .checked_mul(capacity)
            .filter(|rows| rows.checked_mul(n_clusters).is_some())
            .ok_or_else(|| {
                DcmError::config(format!(
                    "target distribution too large (clips={n_clips}, capacity={capacity}, clusters={n_clusters})"
                ))
            })?;
        Ok(Self {
            n_rows,
            capacity,
            n_clusters,
            data: vec![0.0; n_rows * n_clusters],
            written: vec![false; n_rows],
        })
    }

    /// Number of rows N.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Slots per clip.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of clusters K.
    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    /// Row index of `slot` in the clip at global `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::SampleOutOfRange`] if `slot` is not below the
    /// capacity or the row lies past N, including when
    /// `offset * capacity + slot` overflows.
    pub fn row_index(&self, offset: usize, slot: usize) -> Result<usize, DcmError> {
        let row = offset
            .checked_mul(self.capacity)
            .and_then(|r| r.checked_add(slot));
        match row {
            Some(row) if slot < self.capacity && row < self.n_rows => Ok(row),
            _ => Err(DcmError::SampleOutOfRange {
                index: offset.saturating_mul(self.capacity).saturating_add(slot),
                max: self.n_rows,
            }),
        }
    }

    /// Row `index`. Panics if out of range; use [`Self::gather`] for
    /// checked access.
    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.n_clusters..(index + 1) * self.n_clusters]
    }

    /// Whether row `index` has ever been refreshed.
    pub fn is_written(&self, index: usize) -> bool {
        self.written[index]
    }

    /// Read-only view of the whole matrix, row-major.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Copies the rows of every valid slot, in [`ValidityMask::flat_indices`]
    /// order, into a flat `[n_valid, K]` buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::SampleOutOfRange`] if a row lies past N.
    pub fn gather(&self, mask: &ValidityMask, offsets: &[usize]) -> Result<Vec<f32>, DcmError> {
        self.check_offsets(mask, offsets)?;
        let mut out = Vec::with_capacity(mask.total() * self.n_clusters);
        for (b, &offset) in offsets.iter().enumerate() {
            for slot in mask.valid_slots(b) {
                out.extend_from_slice(self.row(self.row_index(offset, slot)?));
            }
        }
        Ok(out)
    }

    /// Refreshes the rows of the batch from its soft assignment.
    ///
    /// `soft` is the flat `[batch, capacity, K]` assignment. Only valid
    /// slots are read or written. Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::ShapeMismatch`] if `soft`, `mask` or `offsets`
    /// disagree on the batch layout, and [`DcmError::SampleOutOfRange`] if a
    /// clip's rows lie past N. Nothing is written on error.
    pub fn update(
        &mut self,
        soft: &[f32],
        mask: &ValidityMask,
        offsets: &[usize],
    ) -> Result<usize, DcmError> {
        let k = self.n_clusters;
        let expected = mask.batch() * mask.capacity() * k;
        if soft.len() != expected {
            return Err(DcmError::shape(
                "soft assignment",
                format!("{expected} values ([{}, {}, {k}])", mask.batch(), mask.capacity()),
                format!("{} values", soft.len()),
            ));
        }
        self.check_offsets(mask, offsets)?;

        let mut written = 0;
        let mut freq = vec![0.0f32; k];
        let mut raw = vec![0.0f32; k];
        for (b, &offset) in offsets.iter().enumerate() {
            let slots = mask.valid_slots(b);
            if slots.is_empty() {
                continue;
            }
            let s_at = |slot: usize| {
                let start = (b * mask.capacity() + slot) * k;
                &soft[start..start + k]
            };

            freq.iter_mut().for_each(|f| *f = 0.0);
            for &slot in &slots {
                for (f, &v) in freq.iter_mut().zip(s_at(slot)) {
                    *f += v;
                }
            }

            for &slot in &slots {
                for ((t, &v), &f) in raw.iter_mut().zip(s_at(slot)).zip(&freq) {
                    *t = if f > 0.0 && f.is_finite() { v * v / f } else { 0.0 };
                }
                let total: f32 = raw.iter().sum();
                let row = self.row_index(offset, slot)?;
                if !(total > 0.0 && total.is_finite()) {
                    warn!(row, "degenerate target row skipped");
                    continue;
                }
                let dst = &mut self.data[row * k..(row + 1) * k];
                for (d, &t) in dst.iter_mut().zip(&raw) {
                    *d = t / total;
                }
                self.written[row] = true;
                written += 1;
            }
        }
        Ok(written)
    }

    fn check_offsets(&self, mask: &ValidityMask, offsets: &[usize]) -> Result<(), DcmError> {
        if offsets.len() != mask.batch() {
            return Err(DcmError::shape("sample offsets", mask.batch(), offsets.len()));
        }
        if mask.capacity() != self.capacity {
            return Err(DcmError::shape("slot capacity", self.capacity, mask.capacity()));
        }
        for &offset in offsets {
            self.row_index(offset, self.capacity - 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_mask(batch: usize, capacity: usize) -> ValidityMask {
        ValidityMask::from_flags(vec![true; batch * capacity], batch, capacity).unwrap()
    }

    #[test]
    fn zero_sizes_rejected() {
        assert!(TargetDistribution::new(0, 2, 3).is_err());
        assert!(TargetDistribution::new(2, 0, 3).is_err());
        assert!(TargetDistribution::new(2, 2, 0).is_err());
    }

    #[test]
    fn starts_at_zero() {
        let target = TargetDistribution::new(3, 2, 4).unwrap();
        assert_eq!(target.n_rows(), 6);
        assert!(target.as_slice().iter().all(|&v| v == 0.0));
        assert!((0..6).all(|r| !target.is_written(r)));
    }

    #[test]
    fn refreshed_rows_sum_to_one() {
        let mut target = TargetDistribution::new(2, 2, 3).unwrap();
        let s = [0.6, 0.3, 0.1, 0.2, 0.5, 0.3];
        let written = target.update(&s, &full_mask(1, 2), &[0]).unwrap();
        assert_eq!(written, 2);
        for r in 0..2 {
            let sum: f32 = target.row(r).iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn sharpening_matches_formula() {
        let mut target = TargetDistribution::new(1, 2, 2).unwrap();
        let s = [0.8, 0.2, 0.4, 0.6];
        target.update(&s, &full_mask(1, 2), &[0]).unwrap();

        let f = [1.2f32, 0.8];
        let raw = [0.64 / f[0], 0.04 / f[1]];
        let expected0 = raw[0] / (raw[0] + raw[1]);
        assert!((target.row(0)[0] - expected0).abs() < 1e-6);
        // The dominant cluster gets sharper.
        assert!(target.row(0)[0] > 0.8);
    }

    #[test]
    fn one_hot_is_fixed_point() {
        let mut target = TargetDistribution::new(1, 1, 3).unwrap();
        target.update(&[0.0, 1.0, 0.0], &full_mask(1, 1), &[0]).unwrap();
        assert_eq!(target.row(0), &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn rows_outside_batch_untouched() {
        let mut target = TargetDistribution::new(4, 2, 2).unwrap();
        target.update(&[0.5, 0.5, 0.5, 0.5], &full_mask(1, 2), &[0]).unwrap();
        let before = target.clone();

        target.update(&[0.9, 0.1, 0.3, 0.7], &full_mask(1, 2), &[2]).unwrap();
        assert_eq!(target.row(0), before.row(0));
        assert_eq!(target.row(1), before.row(1));
        assert_eq!(target.row(2), before.row(2));
        assert_eq!(target.row(3), before.row(3));
        assert_eq!(target.row(6), before.row(6));
        assert_ne!(target.row(4), before.row(4));
    }

    #[test]
    fn padded_slots_not_written() {
        let mut target = TargetDistribution::new(1, 3, 2).unwrap();
        let mask = ValidityMask::from_flags(vec![true, false, true], 1, 3).unwrap();
        target
            .update(&[0.7, 0.3, 0.0, 0.0, 0.4, 0.6], &mask, &[0])
            .unwrap();
        assert!(target.is_written(0));
        assert!(!target.is_written(1));
        assert!(target.is_written(2));
        assert_eq!(target.row(1), &[0.0, 0.0]);
    }

    #[test]
    fn clip_without_actors_is_skipped() {
        let mut target = TargetDistribution::new(2, 2, 2).unwrap();
        let mask = ValidityMask::from_flags(vec![false, false, true, true], 2, 2).unwrap();
        let written = target
            .update(&[0.0, 0.0, 0.0, 0.0, 0.5, 0.5, 0.2, 0.8], &mask, &[0, 1])
            .unwrap();
        assert_eq!(written, 2);
        assert!(!target.is_written(0));
        assert!(target.as_slice().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn offset_past_end_rejected_without_writing() {
        let mut target = TargetDistribution::new(2, 2, 2).unwrap();
        let before = target.clone();
        let err = target
            .update(&[0.5; 8], &full_mask(2, 2), &[0, 2])
            .unwrap_err();
        assert!(matches!(err, DcmError::SampleOutOfRange { .. }));
        assert_eq!(target, before);
    }

    #[test]
    fn wrapping_offset_rejected_without_writing() {
        let mut target = TargetDistribution::new(2, 2, 2).unwrap();
        let before = target.clone();
        // offset * 2 wraps to 0 in release arithmetic
        let huge = usize::MAX / 2 + 1;
        let err = target
            .update(&[0.5; 8], &full_mask(2, 2), &[1, huge])
            .unwrap_err();
        assert!(matches!(
            err,
            DcmError::SampleOutOfRange { index: usize::MAX, max: 4 }
        ));
        assert_eq!(target, before);
        assert!(target.gather(&full_mask(1, 2), &[huge]).is_err());
    }

    #[test]
    fn row_index_bounds() {
        let target = TargetDistribution::new(3, 2, 2).unwrap();
        assert_eq!(target.row_index(2, 1).unwrap(), 5);
        assert!(target.row_index(3, 0).is_err());
        assert!(target.row_index(0, 2).is_err());
        assert!(target.row_index(usize::MAX, 1).is_err());
    }

    #[test]
    fn gather_follows_mask_order() {
        let mut target = TargetDistribution::new(2, 2, 2).unwrap();
        target
            .update(&[1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0], &full_mask(2, 2), &[0, 1])
            .unwrap();
        let mask = ValidityMask::from_flags(vec![false, true, true, false], 2, 2).unwrap();
        let rows = target.gather(&mask, &[1, 0]).unwrap();
        // clip 0 -> offset 1, slot 1 -> row 3; clip 1 -> offset 0, slot 0 -> row 0
        assert_eq!(rows, vec![0.0, 1.0, 1.0, 0.0]);
    }
}
