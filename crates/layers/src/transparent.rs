//! Encoder-decoder attention over a learned mixture of encoder layers.
//!
//! The embedding output and every `layers_per_encoder_module`-th encoder
//! layer output are stacked into `encoder_num_modules + 1` candidates. A
//! mixing matrix, softmax-normalised over the candidates, turns them into
//! one memory per decoder module; decoder layer `i` attends to the memory of
//! module `i / layers_per_decoder_module`. The mixture is computed once per
//! forward pass and cached on the [`Context`].

use mesh::ops::{dropout, einsum, rename_dimension, softmax, stack, unstack};
use mesh::{Dimension, Initializer, Mesh, MeshTensor, Shape, VariableStore};

use crate::config::TransparentConfig;
use crate::context::{Context, MEMORY_LENGTH_NAME};
use crate::enc_dec::EncDecAttention;
use crate::error::{LayerError, Result};

pub const ENCODER_MODULES_NAME: &str = "encoder_module_outputs";
pub const DECODER_MODULES_NAME: &str = "decoder_module_inputs";

/// Name of the mixing variable shared by the layers of one decoder.
pub const MIXING_VARIABLE: &str = "transparent/w";

#[derive(Debug, Clone)]
pub struct TransparentEncDecAttention {
    config: TransparentConfig,
    base: EncDecAttention,
    mixing: MeshTensor,
}

impl TransparentEncDecAttention {
    /// Creates the layer's projections. `mixing` is the matrix of an earlier
    /// layer of the same decoder; a new one is created when it is `None`.
    pub fn new(
        mesh: &Mesh,
        store: &VariableStore,
        name: &str,
        model_dim: &Dimension,
        config: TransparentConfig,
        mixing: Option<MeshTensor>,
    ) -> Result<Self> {
        config.validate()?;
        let mixing = match mixing {
            Some(mixing) => {
                if mixing.shape() != &Self::mixing_shape(&config)? {
                    return Err(LayerError::config(format!(
                        "shared mixing weights {} do not fit {} encoder and {} decoder modules",
                        mixing.shape(),
                        config.encoder_num_modules,
                        config.decoder_num_modules
                    )));
                }
                mixing
            }
            None => {
                let shape = Self::mixing_shape(&config)?;
                let fan = (shape.elem_count() as f64).powf(-0.5);
                store.get_variable(
                    MIXING_VARIABLE,
                    &shape,
                    Initializer::Normal { stddev: fan },
                    mesh.activation_dtype(),
                    mesh.device(),
                )?
            }
        };
        let base = EncDecAttention::new(mesh, store, name, model_dim, config.attention.clone())?;
        Ok(Self {
            config,
            base,
            mixing,
        })
    }

    fn mixing_shape(config: &TransparentConfig) -> Result<Shape> {
        Ok(Shape::new(vec![
            Dimension::new(ENCODER_MODULES_NAME, config.encoder_num_modules + 1),
            Dimension::new(DECODER_MODULES_NAME, config.decoder_num_modules),
        ])?)
    }

    pub fn mixing(&self) -> &MeshTensor {
        &self.mixing
    }

    pub fn base(&self) -> &EncDecAttention {
        &self.base
    }

    /// One memory per decoder module, computed on first use.
    pub fn decoder_inputs(&self, ctx: &mut Context) -> Result<Vec<MeshTensor>> {
        if let Some(inputs) = ctx.decoder_inputs() {
            return Ok(inputs.to_vec());
        }
        if ctx.encoder_layer_outputs.is_empty() {
            return Err(LayerError::MissingContext {
                what: "the encoder layer outputs",
            });
        }
        let length_name = ctx.length_dim.name().to_string();
        let modules = ctx
            .encoder_layer_outputs
            .iter()
            .step_by(self.config.layers_per_encoder_module)
            .map(|output| {
                if output.has_dim(MEMORY_LENGTH_NAME) {
                    Ok(output.clone())
                } else {
                    Ok(rename_dimension(output, &length_name, MEMORY_LENGTH_NAME)?)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        if modules.len() != self.config.encoder_num_modules + 1 {
            return Err(LayerError::config(format!(
                "{} encoder layer outputs give {} modules every {} layers, expected {}",
                ctx.encoder_layer_outputs.len(),
                modules.len(),
                self.config.layers_per_encoder_module,
                self.config.encoder_num_modules + 1
            )));
        }
        let stacked = stack(&modules.iter().collect::<Vec<_>>(), ENCODER_MODULES_NAME, 0)?;

        let mut weights = self.mixing.clone();
        if ctx.is_training() {
            weights = dropout(&weights, self.config.attention.dropout_rate, &[])?;
        }
        let weights = softmax(&weights, ENCODER_MODULES_NAME, None)?;
        let mut dims = vec![Dimension::new(
            DECODER_MODULES_NAME,
            self.config.decoder_num_modules,
        )];
        dims.extend(stacked.shape().without(&[ENCODER_MODULES_NAME]).dims().iter().cloned());
        let mixed = einsum(&[&stacked, &weights], &Shape::new(dims)?)?;
        let inputs = unstack(&mixed, DECODER_MODULES_NAME)?;
        log::debug!(
            "mixed {} encoder modules into {} decoder inputs",
            modules.len(),
            inputs.len()
        );
        ctx.set_decoder_inputs(inputs.clone());
        Ok(inputs)
    }

    pub fn apply(&self, ctx: &mut Context, x: &MeshTensor) -> Result<MeshTensor> {
        let module = ctx.layer_index / self.config.layers_per_decoder_module;
        if module >= self.config.decoder_num_modules {
            return Err(LayerError::config(format!(
                "layer {} belongs to decoder module {module}, but there are only {}",
                ctx.layer_index, self.config.decoder_num_modules
            )));
        }
        self.base.apply_to(ctx, x, |ctx| {
            let mut inputs = self.decoder_inputs(ctx)?;
            Ok(inputs.swap_remove(module))
        })
    }
}
