//! RoI-align sampling weights.
//!
//! Region pooling is expressed as a sparse-in-practice weight matrix so the
//! tensor layer can pool with a single batched matmul:
//!
//! ```text
//! pooled[b] = W[b] · features[b]      W[b]: [S·P·P, h·w]   features[b]: [h·w, C]
//! ```
//!
//! Each pooled cell takes one bilinear sample at the centre of its bin
//! (sampling ratio 1). Sample points outside the map contribute nothing.

use crate::config::{ImageSize, RoiAlignConfig};
use crate::mask::{ActorBoxes, BoxCoords};

/// Spatial size of a feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureGrid {
    /// Rows (h).
    pub height: usize,
    /// Columns (w).
    pub width: usize,
}

impl FeatureGrid {
    /// Number of cells.
    pub fn cells(&self) -> usize {
        self.height * self.width
    }
}

/// Builds the pooling weights for a whole batch.
///
/// `boxes` are in image pixels and must be NaN-free (see
/// [`ActorBoxes::sanitized`]). Returns a flat
/// `[batch, capacity · P · P, grid.height · grid.width]` buffer, pooled
/// rows ordered `(slot, bin_y, bin_x)`.
///
/// # Example
///
/// ```
/// use dcm_core::{roi_align_weights, ActorBoxes, FeatureGrid, ImageSize, RoiAlignConfig};
///
/// let boxes = ActorBoxes::from_flat(&[0.0, 0.0, 16.0, 16.0], 1, 1).unwrap();
/// let cfg = RoiAlignConfig { output_size: 2, ..RoiAlignConfig::default() };
/// let grid = FeatureGrid { height: 2, width: 2 };
/// let w = roi_align_weights(&boxes, ImageSize { width: 16, height: 16 }, grid, &cfg);
/// assert_eq!(w.len(), 4 * 4);
/// ```
pub fn roi_align_weights(
    boxes: &ActorBoxes,
    image: ImageSize,
    grid: FeatureGrid,
    cfg: &RoiAlignConfig,
) -> Vec<f32> {
    let bins = cfg.output_size * cfg.output_size;
    let cells = grid.cells();
    let scale_x = grid.width as f32 / image.width as f32 * cfg.spatial_scale;
    let scale_y = grid.height as f32 / image.height as f32 * cfg.spatial_scale;

    let mut weights = vec![0.0f32; boxes.batch() * boxes.capacity() * bins * cells];
    for (slot_idx, coords) in boxes.iter().enumerate() {
        let base = slot_idx * bins * cells;
        box_weights(
            coords,
            scale_x,
            scale_y,
            grid,
            cfg,
            &mut weights[base..base + bins * cells],
        );
    }
    weights
}

fn box_weights(
    coords: &BoxCoords,
    scale_x: f32,
    scale_y: f32,
    grid: FeatureGrid,
    cfg: &RoiAlignConfig,
    out: &mut [f32],
) {
    let offset = if cfg.aligned { 0.5 } else { 0.0 };
    let start_x = coords[0] * scale_x - offset;
    let start_y = coords[1] * scale_y - offset;
    let mut roi_w = coords[2] * scale_x - offset - start_x;
    let mut roi_h = coords[3] * scale_y - offset - start_y;
    if !cfg.aligned {
        roi_w = roi_w.max(1.0);
        roi_h = roi_h.max(1.0);
    }
    let p = cfg.output_size;
    let bin_w = roi_w / p as f32;
    let bin_h = roi_h / p as f32;
    let cells = grid.cells();

    for ph in 0..p {
        let y = start_y + (ph as f32 + 0.5) * bin_h;
        for pw in 0..p {
            let x = start_x + (pw as f32 + 0.5) * bin_w;
            let row = &mut out[(ph * p + pw) * cells..(ph * p + pw + 1) * cells];
            for (cell, w) in bilinear(y, x, grid) {
                row[cell] += w;
            }
        }
    }
}

/// Bilinear taps of a sample point as `(cell, weight)` pairs.
fn bilinear(y: f32, x: f32, grid: FeatureGrid) -> Vec<(usize, f32)> {
    let (height, width) = (grid.height as f32, grid.width as f32);
    if y < -1.0 || y > height || x < -1.0 || x > width {
        return Vec::new();
    }
    let y = y.max(0.0);
    let x = x.max(0.0);

    let (y_low, y_high, y) = clamp_axis(y, grid.height);
    let (x_low, x_high, x) = clamp_axis(x, grid.width);

    let ly = y - y_low as f32;
    let lx = x - x_low as f32;
    let hy = 1.0 - ly;
    let hx = 1.0 - lx;

    let at = |r: usize, c: usize| r * grid.width + c;
    vec![
        (at(y_low, x_low), hy * hx),
        (at(y_low, x_high), hy * lx),
        (at(y_high, x_low), ly * hx),
        (at(y_high, x_high), ly * lx),
    ]
}

fn clamp_axis(v: f32, len: usize) -> (usize, usize, f32) {
    let low = v.floor() as usize;
    if low + 1 >= len {
        let last = len - 1;
        (last, last, last as f32)
    } else {
        (low, low + 1, v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(output_size: usize, aligned: bool) -> RoiAlignConfig {
        RoiAlignConfig {
            output_size,
            spatial_scale: 1.0,
            aligned,
        }
    }

    #[test]
    fn in_map_samples_sum_to_one() {
        let boxes = ActorBoxes::from_flat(&[4.0, 4.0, 28.0, 20.0], 1, 1).unwrap();
        let grid = FeatureGrid {
            height: 4,
            width: 4,
        };
        let w = roi_align_weights(
            &boxes,
            ImageSize {
                width: 32,
                height: 32,
            },
            grid,
            &cfg(3, true),
        );
        for row in w.chunks_exact(grid.cells()) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sum {sum}");
        }
    }

    #[test]
    fn sample_on_cell_centre_hits_one_cell() {
        // Box spanning exactly feature cell (1, 2) with aligned sampling
        // lands on integer coordinates.
        let boxes = ActorBoxes::from_flat(&[2.0, 1.0, 3.0, 2.0], 1, 1).unwrap();
        let grid = FeatureGrid {
            height: 4,
            width: 4,
        };
        let w = roi_align_weights(
            &boxes,
            ImageSize {
                width: 4,
                height: 4,
            },
            grid,
            &cfg(1, true),
        );
        assert!((w[1 * 4 + 2] - 1.0).abs() < 1e-6);
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_box_is_finite() {
        let boxes = ActorBoxes::from_flat(&[0.0; 4], 1, 1).unwrap();
        let w = roi_align_weights(
            &boxes,
            ImageSize {
                width: 16,
                height: 16,
            },
            FeatureGrid {
                height: 2,
                width: 2,
            },
            &cfg(2, true),
        );
        assert!(w.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn far_outside_box_contributes_nothing() {
        let boxes = ActorBoxes::from_flat(&[100.0, 100.0, 120.0, 120.0], 1, 1).unwrap();
        let w = roi_align_weights(
            &boxes,
            ImageSize {
                width: 16,
                height: 16,
            },
            FeatureGrid {
                height: 2,
                width: 2,
            },
            &cfg(2, false),
        );
        assert!(w.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn layout_is_slot_major() {
        let nan_free = [0.0, 0.0, 8.0, 8.0, 8.0, 8.0, 16.0, 16.0];
        let boxes = ActorBoxes::from_flat(&nan_free, 1, 2).unwrap();
        let grid = FeatureGrid {
            height: 2,
            width: 2,
        };
        let w = roi_align_weights(
            &boxes,
            ImageSize {
                width: 16,
                height: 16,
            },
            grid,
            &cfg(1, true),
        );
        assert_eq!(w.len(), 2 * grid.cells());
        // First box covers the top-left cell, second the bottom-right one.
        assert!((w[0] - 1.0).abs() < 1e-6);
        assert!((w[grid.cells() + 3] - 1.0).abs() < 1e-6);
    }
}
