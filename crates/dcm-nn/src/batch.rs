//! One training batch as handed over by the loader.

use candle_core::{DType, Tensor};
use dcm_core::{ActorBoxes, DcmError, ImageSize, Modality};

/// Frames, flows, actor boxes and global clip offsets of one batch.
///
/// | field     | shape                         |
/// |-----------|-------------------------------|
/// | `frames`  | `[B, 3, T, H, W]`             |
/// | `flows`   | `[B, 2, T, H, W]`             |
/// | `boxes`   | `[B, S, 2, 2]`, NaN = padding |
/// | `offsets` | `B` global clip indices       |
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use dcm_nn::ActorBatch;
///
/// let dev = Device::Cpu;
/// let frames = Tensor::zeros((1, 3, 2, 16, 16), DType::F32, &dev).unwrap();
/// let flows = Tensor::zeros((1, 2, 2, 16, 16), DType::F32, &dev).unwrap();
/// let boxes = Tensor::zeros((1, 4, 2, 2), DType::F32, &dev).unwrap();
/// let batch = ActorBatch::new(frames, flows, boxes, vec![0]).unwrap();
/// assert_eq!(batch.capacity(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct ActorBatch {
    frames: Tensor,
    flows: Tensor,
    boxes: Tensor,
    offsets: Vec<usize>,
}

impl ActorBatch {
    /// Validates shapes and wraps the tensors.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::EmptyBatch`] for zero clips and
    /// [`DcmError::ShapeMismatch`] for any rank, channel, batch or spatial
    /// disagreement.
    pub fn new(
        frames: Tensor,
        flows: Tensor,
        boxes: Tensor,
        offsets: Vec<usize>,
    ) -> Result<Self, DcmError> {
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("ActorBatch::new: {e}"),
        };

        let frame_dims = check_modality("frames", &frames, Modality::Frame)?;
        let flow_dims = check_modality("flows", &flows, Modality::Flow)?;
        if frame_dims[0] == 0 {
            return Err(DcmError::EmptyBatch);
        }
        let same = frame_dims[0] == flow_dims[0] && frame_dims[2..] == flow_dims[2..];
        if !same {
            return Err(DcmError::shape(
                "flows",
                format!("[{}, 2, {}, {}, {}]", frame_dims[0], frame_dims[2], frame_dims[3], frame_dims[4]),
                format!("{:?}", flows.dims()),
            ));
        }

        let b = frame_dims[0];
        let box_ok = boxes.rank() == 4
            && boxes.dims()[0] == b
            && boxes.dims()[2] == 2
            && boxes.dims()[3] == 2;
        if !box_ok {
            return Err(DcmError::shape(
                "bboxs",
                format!("[{b}, S, 2, 2]"),
                format!("{:?}", boxes.dims()),
            ));
        }
        if offsets.len() != b {
            return Err(DcmError::shape("sample offsets", b, offsets.len()));
        }

        Ok(Self {
            frames: frames.to_dtype(DType::F32).map_err(map_err)?,
            flows: flows.to_dtype(DType::F32).map_err(map_err)?,
            boxes: boxes.to_dtype(DType::F32).map_err(map_err)?,
            offsets,
        })
    }

    /// Input tensor of `modality`.
    pub fn input(&self, modality: Modality) -> &Tensor {
        match modality {
            Modality::Frame => &self.frames,
            Modality::Flow => &self.flows,
        }
    }

    /// Raw box tensor `[B, S, 2, 2]`.
    pub fn boxes(&self) -> &Tensor {
        &self.boxes
    }

    /// Global clip offsets.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Number of clips B.
    pub fn batch_size(&self) -> usize {
        self.offsets.len()
    }

    /// Actor slots per clip S.
    pub fn capacity(&self) -> usize {
        self.boxes.dims()[1]
    }

    /// Clip length T.
    pub fn clip_len(&self) -> usize {
        self.frames.dims()[2]
    }

    /// Spatial size of the inputs.
    pub fn image_size(&self) -> ImageSize {
        let dims = self.frames.dims();
        ImageSize {
            width: dims[4],
            height: dims[3],
        }
    }

    /// Boxes copied to the host.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Internal`] if the device copy fails.
    pub fn actor_boxes(&self) -> Result<ActorBoxes, DcmError> {
        let flat = self
            .boxes
            .flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| DcmError::Internal {
                message: format!("ActorBatch::actor_boxes: {e}"),
            })?;
        ActorBoxes::from_flat(&flat, self.batch_size(), self.capacity())
    }
}

fn check_modality(what: &str, t: &Tensor, modality: Modality) -> Result<Vec<usize>, DcmError> {
    let dims = t.dims();
    if dims.len() != 5 || dims[1] != modality.channels() {
        return Err(DcmError::shape(
            what,
            format!("[B, {}, T, H, W]", modality.channels()),
            format!("{dims:?}"),
        ));
    }
    Ok(dims.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn accessors() {
        let batch = ActorBatch::new(
            zeros(&[2, 3, 4, 16, 24]),
            zeros(&[2, 2, 4, 16, 24]),
            zeros(&[2, 5, 2, 2]),
            vec![3, 7],
        )
        .unwrap();
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.capacity(), 5);
        assert_eq!(batch.clip_len(), 4);
        assert_eq!(
            batch.image_size(),
            ImageSize {
                width: 24,
                height: 16
            }
        );
        assert_eq!(batch.input(Modality::Flow).dims()[1], 2);
        assert_eq!(batch.actor_boxes().unwrap().capacity(), 5);
    }

    #[test]
    fn wrong_frame_channels() {
        let err = ActorBatch::new(
            zeros(&[1, 2, 2, 8, 8]),
            zeros(&[1, 2, 2, 8, 8]),
            zeros(&[1, 3, 2, 2]),
            vec![0],
        )
        .unwrap_err();
        assert!(matches!(err, DcmError::ShapeMismatch { .. }));
    }

    #[test]
    fn box_rank_mismatch() {
        let err = ActorBatch::new(
            zeros(&[1, 3, 2, 8, 8]),
            zeros(&[1, 2, 2, 8, 8]),
            zeros(&[1, 3, 4]),
            vec![0],
        )
        .unwrap_err();
        assert!(matches!(err, DcmError::ShapeMismatch { .. }));
    }

    #[test]
    fn flow_size_mismatch() {
        assert!(ActorBatch::new(
            zeros(&[1, 3, 2, 8, 8]),
            zeros(&[1, 2, 2, 8, 16]),
            zeros(&[1, 3, 2, 2]),
            vec![0],
        )
        .is_err());
    }

    #[test]
    fn offsets_must_match_batch() {
        assert!(ActorBatch::new(
            zeros(&[2, 3, 2, 8, 8]),
            zeros(&[2, 2, 2, 8, 8]),
            zeros(&[2, 3, 2, 2]),
            vec![0],
        )
        .is_err());
    }

    #[test]
    fn empty_batch() {
        let err = ActorBatch::new(
            zeros(&[0, 3, 2, 8, 8]),
            zeros(&[0, 2, 2, 8, 8]),
            zeros(&[0, 3, 2, 2]),
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, DcmError::EmptyBatch));
    }
}
