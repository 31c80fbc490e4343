//! Per-modality autoencoder.
//!
//! The clustering core only relies on two shape contracts:
//!
//! - a [`FeatureExtractor`] maps `[B, C, T, H, W]` to a latent volume
//!   `[B, Cz, T, H/8, W/8]`
//! - an [`ImageGenerator`] maps one latent slice `[B, Cz, H/8, W/8]` back
//!   to `[B, C, H, W]`
//!
//! [`ConvEncoder`] and [`ConvDecoder`] are the stock implementations.
//! Encoder and decoder parameters live in separate [`VarMap`]s so each
//! can be driven by its own optimizer.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{
    conv2d_no_bias, conv_transpose2d_no_bias, Conv2d, Conv2dConfig, ConvTranspose2d,
    ConvTranspose2dConfig, Module, VarBuilder, VarMap,
};
use dcm_core::{AutoencoderConfig, DcmError, Modality, SPATIAL_STRIDE};

const LEAK: f64 = 0.1;

/// Encodes a clip into a spatiotemporal latent volume.
pub trait FeatureExtractor {
    /// `[B, C, T, H, W]` → `[B, Cz, T, H/8, W/8]`.
    fn extract(&self, clip: &Tensor) -> candle_core::Result<Tensor>;

    /// Cz.
    fn latent_channels(&self) -> usize;
}

/// Decodes one latent slice into an image.
pub trait ImageGenerator {
    /// `[B, Cz, h, w]` → `[B, C, 8h, 8w]`, values in `[-1, 1]`.
    fn generate(&self, latent: &Tensor) -> candle_core::Result<Tensor>;

    /// C.
    fn out_channels(&self) -> usize;
}

fn leaky_relu(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.maximum(&xs.affine(LEAK, 0.0)?)
}

/// Three stride-2 convolutions applied to every time slice.
pub struct ConvEncoder {
    layers: Vec<Conv2d>,
    latent_channels: usize,
}

impl ConvEncoder {
    /// Builds the encoder under `vb`.
    ///
    /// # Errors
    ///
    /// Propagates candle parameter-creation failures.
    pub fn new(
        in_channels: usize,
        config: &AutoencoderConfig,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let hidden = config.hidden_channels;
        let widths = [in_channels, hidden, hidden * 2, config.latent_channels];
        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, w)| conv2d_no_bias(w[0], w[1], 4, cfg, vb.pp(format!("conv{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            latent_channels: config.latent_channels,
        })
    }
}

impl FeatureExtractor for ConvEncoder {
    fn extract(&self, clip: &Tensor) -> candle_core::Result<Tensor> {
        let (b, c, t, h, w) = clip.dims5()?;
        // [B, C, T, H, W] -> [B·T, C, H, W]
        let mut xs = clip
            .permute((0, 2, 1, 3, 4))?
            .reshape((b * t, c, h, w))?;
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i < last {
                xs = leaky_relu(&xs)?;
            }
        }
        let (_, cz, fh, fw) = xs.dims4()?;
        xs.reshape((b, t, cz, fh, fw))?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()
    }

    fn latent_channels(&self) -> usize {
        self.latent_channels
    }
}

/// Two 1×1 transposed convolutions followed by three ×2 upsampling ones,
/// `tanh` on the output.
pub struct ConvDecoder {
    layers: Vec<ConvTranspose2d>,
    out_channels: usize,
}

impl ConvDecoder {
    /// Builds the decoder under `vb`.
    ///
    /// # Errors
    ///
    /// Propagates candle parameter-creation failures.
    pub fn new(
        out_channels: usize,
        config: &AutoencoderConfig,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let pointwise = ConvTranspose2dConfig::default();
        let upsample = ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let h = config.hidden_channels;
        let plan = [
            (config.latent_channels, h * 8, 1, pointwise),
            (h * 8, h * 4, 1, pointwise),
            (h * 4, h * 2, 4, upsample),
            (h * 2, h, 4, upsample),
            (h, out_channels, 4, upsample),
        ];
        let layers = plan
            .into_iter()
            .enumerate()
            .map(|(i, (cin, cout, k, cfg))| {
                conv_transpose2d_no_bias(cin, cout, k, cfg, vb.pp(format!("deconv{i}")))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            out_channels,
        })
    }
}

impl ImageGenerator for ConvDecoder {
    fn generate(&self, latent: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = latent.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            xs = if i < last { leaky_relu(&xs)? } else { xs.tanh()? };
        }
        Ok(xs)
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }
}

/// Result of one autoencoder pass.
#[derive(Debug, Clone)]
pub struct AutoencoderOutput {
    /// `[B, Cz, T, h, w]`.
    pub latent: Tensor,
    /// Reconstruction of the last input frame, `[B, C, H, W]`.
    pub reconstruction: Tensor,
}

/// Encoder plus decoder of one modality, each with its own parameter group.
pub struct Autoencoder {
    modality: Modality,
    encoder: Box<dyn FeatureExtractor>,
    decoder: Box<dyn ImageGenerator>,
    encoder_vars: VarMap,
    decoder_vars: VarMap,
}

impl std::fmt::Debug for Autoencoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Autoencoder({}, C={}, Cz={}, {} enc / {} dec tensors)",
            self.modality,
            self.decoder.out_channels(),
            self.encoder.latent_channels(),
            self.encoder_vars.all_vars().len(),
            self.decoder_vars.all_vars().len(),
        )
    }
}

impl Autoencoder {
    /// Stock convolutional autoencoder for `modality`.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::Internal`] if parameter creation fails.
    pub fn new(
        modality: Modality,
        config: &AutoencoderConfig,
        device: &Device,
    ) -> Result<Self, DcmError> {
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("Autoencoder::new({modality}): {e}"),
        };
        let encoder_vars = VarMap::new();
        let decoder_vars = VarMap::new();
        let channels = modality.channels();
        let enc_vb = VarBuilder::from_varmap(&encoder_vars, DType::F32, device);
        let dec_vb = VarBuilder::from_varmap(&decoder_vars, DType::F32, device);
        let encoder = ConvEncoder::new(channels, config, enc_vb.pp(format!("{modality}.enc")))
            .map_err(map_err)?;
        let decoder = ConvDecoder::new(channels, config, dec_vb.pp(format!("{modality}.dec")))
            .map_err(map_err)?;
        Ok(Self::from_parts(
            modality,
            Box::new(encoder),
            encoder_vars,
            Box::new(decoder),
            decoder_vars,
        ))
    }

    /// Wraps a custom extractor/generator pair. The var maps must hold the
    /// trainable parameters of each part.
    pub fn from_parts(
        modality: Modality,
        encoder: Box<dyn FeatureExtractor>,
        encoder_vars: VarMap,
        decoder: Box<dyn ImageGenerator>,
        decoder_vars: VarMap,
    ) -> Self {
        Self {
            modality,
            encoder,
            decoder,
            encoder_vars,
            decoder_vars,
        }
    }

    /// Modality this autoencoder handles.
    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// Latent channel count Cz.
    pub fn latent_channels(&self) -> usize {
        self.encoder.latent_channels()
    }

    /// Encoder parameter group.
    pub fn encoder_vars(&self) -> Vec<Var> {
        self.encoder_vars.all_vars()
    }

    /// Decoder parameter group.
    pub fn decoder_vars(&self) -> Vec<Var> {
        self.decoder_vars.all_vars()
    }

    /// Encodes `clip` and reconstructs its last frame from the last
    /// latent slice.
    ///
    /// # Errors
    ///
    /// Returns [`DcmError::ShapeMismatch`] if `clip` is not
    /// `[B, C, T, H, W]` with the modality's channel count and H, W
    /// multiples of 8, and [`DcmError::Internal`] on tensor failures.
    pub fn forward(&self, clip: &Tensor) -> Result<AutoencoderOutput, DcmError> {
        let map_err = |e: candle_core::Error| DcmError::Internal {
            message: format!("Autoencoder::forward({}): {e}", self.modality),
        };
        let dims = clip.dims();
        let ok = dims.len() == 5
            && dims[1] == self.modality.channels()
            && dims[2] > 0
            && dims[3] % SPATIAL_STRIDE == 0
            && dims[4] % SPATIAL_STRIDE == 0;
        if !ok {
            return Err(DcmError::shape(
                format!("{} clip", self.modality),
                format!("[B, {}, T, 8·h, 8·w]", self.modality.channels()),
                format!("{dims:?}"),
            ));
        }

        let latent = self.encoder.extract(clip).map_err(map_err)?;
        let slice = last_slice(&latent).map_err(map_err)?;
        let reconstruction = self.decoder.generate(&slice).map_err(map_err)?;
        Ok(AutoencoderOutput {
            latent,
            reconstruction,
        })
    }
}

/// Last temporal slice of a `[B, C, T, h, w]` volume, `[B, C, h, w]`.
pub fn last_slice(volume: &Tensor) -> candle_core::Result<Tensor> {
    let t = volume.dim(2)?;
    volume.narrow(2, t - 1, 1)?.squeeze(2)
}
