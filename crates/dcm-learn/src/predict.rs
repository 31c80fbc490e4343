//! Per-slot prediction records.

use std::io::Write;

use dcm_core::DcmError;
use dcm_nn::ActorBatch;
use serde::{Deserialize, Serialize};

use crate::model::DeepClusteringModel;

/// Which slots [`DeepClusteringModel::predict`] emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotFilter {
    /// Every slot, padded ones included (zero embedding, label 0).
    All,
    /// Only slots holding a real actor.
    #[default]
    ValidOnly,
}

/// Embedding and hard label of one actor slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Row in the target matrix: `offset * capacity + slot`.
    pub sample_index: usize,
    /// Per-actor embedding, length D.
    pub embedding: Vec<f32>,
    /// Hard cluster label.
    pub cluster: u32,
    /// Whether the slot holds a real actor.
    pub valid: bool,
}

impl DeepClusteringModel {
    /// Runs the shared forward pass and emits one record per slot that
    /// passes `filter`, in `(clip, slot)` order.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::SampleOutOfRange`] if a clip offset lies past the
    /// target matrix, otherwise as [`DeepClusteringModel::forward`].
    pub fn predict(
        &self,
        batch: &ActorBatch,
        filter: SlotFilter,
    ) -> Result<Vec<PredictionRecord>, DcmError> {
        let ctx = self.forward(batch)?;
        let z = ctx
            .clusters
            .z
            .detach()
            .to_vec3::<f32>()
            .map_err(|e| DcmError::Internal {
                message: format!("DeepClusteringModel::predict: {e}"),
            })?;
        let labels = ctx.clusters.labels_host()?;
        let mask = &ctx.clusters.mask;
        let capacity = batch.capacity();

        let mut records = Vec::with_capacity(batch.batch_size() * capacity);
        for (b, (&offset, slots)) in batch.offsets().iter().zip(z).enumerate() {
            for (s, embedding) in slots.into_iter().enumerate() {
                let valid = mask.is_valid(b, s);
                if filter == SlotFilter::ValidOnly && !valid {
                    continue;
                }
                records.push(PredictionRecord {
                    sample_index: self.target_distribution().row_index(offset, s)?,
                    embedding,
                    cluster: labels[b * capacity + s],
                    valid,
                });
            }
        }
        Ok(records)
    }
}

/// Writes `records` as JSON lines.
///
/// # Errors
///
/// Returns [`DcmError::Io`] if serialisation or writing fails.
pub fn write_jsonl<W: Write>(records: &[PredictionRecord], mut writer: W) -> Result<(), DcmError> {
    let io_err = |e: std::io::Error| DcmError::Io {
        message: format!("write_jsonl: {e}"),
    };
    for record in records {
        serde_json::to_writer(&mut writer, record).map_err(|e| DcmError::Io {
            message: format!("write_jsonl: {e}"),
        })?;
        writer.write_all(b"\n").map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_one_record_per_line() {
        let records = vec![
            PredictionRecord {
                sample_index: 3,
                embedding: vec![0.5, -1.0],
                cluster: 2,
                valid: true,
            },
            PredictionRecord {
                sample_index: 4,
                embedding: vec![0.0, 0.0],
                cluster: 0,
                valid: false,
            },
        ];
        let mut buf = Vec::new();
        write_jsonl(&records, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let parsed: Vec<PredictionRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed, records);
    }

    #[test]
    fn default_filter_drops_padding() {
        assert_eq!(SlotFilter::default(), SlotFilter::ValidOnly);
    }
}
