use crate::config::MocoConfig;
use crate::{MocoError, Result};
use mc_nn::{Linear, Module, Parameter, Relu, Sequential};
use mc_tensor::{Tensor, TensorResult};
use std::collections::HashMap;

/// Projection head sitting on top of the backbone features.
#[derive(Debug)]
enum Head {
    /// Plain final projection onto the embedding space.
    Projection(Linear),
    /// Widened head: hidden layer of the penultimate width + ReLU + projection.
    Mlp {
        hidden: Linear,
        relu: Relu,
        fc: Linear,
    },
}

/// Backbone features plus projection head, forming one encoder.
///
/// Query and key encoders are two independent instances of this type built
/// from the same builder, so their parameter names line up one-to-one; the
/// momentum blend pairs parameters by name.
#[derive(Debug)]
pub struct EncoderNet {
    features: Sequential,
    penultimate: usize,
    head: Head,
}

impl EncoderNet {
    /// Assembles an encoder from a feature stem and its final projection.
    /// The stem may be empty, in which case the projection consumes the raw
    /// input directly.
    pub fn new(features: Sequential, penultimate: usize, fc: Linear) -> Result<Self> {
        if fc.input_dim() != penultimate {
            return Err(MocoError::Shape(format!(
                "projection expects {} inputs but penultimate width is {penultimate}",
                fc.input_dim()
            )));
        }
        Ok(Self {
            features,
            penultimate,
            head: Head::Projection(fc),
        })
    }

    /// Embedding dimension produced by the head.
    pub fn embedding_dim(&self) -> usize {
        match &self.head {
            Head::Projection(fc) => fc.output_dim(),
            Head::Mlp { fc, .. } => fc.output_dim(),
        }
    }

    /// Width of the features feeding the head.
    pub fn penultimate_dim(&self) -> usize {
        self.penultimate
    }

    /// Inserts a hidden layer of the penultimate width followed by a ReLU in
    /// front of the final projection. Idempotent once applied.
    pub fn widen_head(&mut self) -> Result<()> {
        let fc = match &self.head {
            Head::Projection(fc) => fc.clone(),
            Head::Mlp { .. } => return Ok(()),
        };
        let hidden = Linear::new("encoder::head_hidden", self.penultimate, self.penultimate)
            .map_err(MocoError::from)?;
        self.head = Head::Mlp {
            hidden,
            relu: Relu::new(),
            fc,
        };
        Ok(())
    }

    fn head_forward(&self, features: &Tensor) -> TensorResult<Tensor> {
        match &self.head {
            Head::Projection(fc) => fc.forward(features),
            Head::Mlp { hidden, relu, fc } => {
                let pre = hidden.forward(features)?;
                let act = relu.forward(&pre)?;
                fc.forward(&act)
            }
        }
    }

    fn head_backward(&mut self, features: &Tensor, grad_output: &Tensor) -> TensorResult<Tensor> {
        match &mut self.head {
            Head::Projection(fc) => fc.backward(features, grad_output),
            Head::Mlp { hidden, relu, fc } => {
                let pre = hidden.forward(features)?;
                let act = relu.forward(&pre)?;
                let grad = fc.backward(&act, grad_output)?;
                let grad = relu.backward(&pre, &grad)?;
                hidden.backward(features, &grad)
            }
        }
    }
}

impl Module for EncoderNet {
    fn forward(&self, input: &Tensor) -> TensorResult<Tensor> {
        let features = self.features.forward(input)?;
        self.head_forward(&features)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> TensorResult<Tensor> {
        let features = self.features.forward(input)?;
        let grad_features = self.head_backward(&features, grad_output)?;
        self.features.backward(input, &grad_features)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> TensorResult<()>,
    ) -> TensorResult<()> {
        self.features.visit_parameters(visitor)?;
        match &self.head {
            Head::Projection(fc) => fc.visit_parameters(visitor),
            Head::Mlp { hidden, fc, .. } => {
                hidden.visit_parameters(visitor)?;
                fc.visit_parameters(visitor)
            }
        }
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> TensorResult<()>,
    ) -> TensorResult<()> {
        self.features.visit_parameters_mut(visitor)?;
        match &mut self.head {
            Head::Projection(fc) => fc.visit_parameters_mut(visitor),
            Head::Mlp { hidden, fc, .. } => {
                hidden.visit_parameters_mut(visitor)?;
                fc.visit_parameters_mut(visitor)
            }
        }
    }
}

type BackboneBuilder = Box<dyn Fn(&MocoConfig) -> Result<EncoderNet> + Send + Sync>;

/// Registry resolving a backbone name to a builder producing fresh encoder
/// instances. Callers may register their own builders as long as they honour
/// the image-batch in, `batch x emb_dim` out contract.
pub struct BackboneFactory {
    builders: HashMap<String, BackboneBuilder>,
}

impl core::fmt::Debug for BackboneFactory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        write!(f, "BackboneFactory({names:?})")
    }
}

impl Default for BackboneFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BackboneFactory {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Creates a registry pre-populated with the built-in backbones.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register("linear", |config: &MocoConfig| {
            let fc = Linear::new("encoder::fc", config.input_dim, config.emb_dim)
                .map_err(MocoError::from)?;
            EncoderNet::new(Sequential::new(), config.input_dim, fc)
        });
        factory.register("mlp", |config: &MocoConfig| {
            let hidden = config.emb_dim * 4;
            let mut stem = Sequential::new();
            stem.push(Linear::new("encoder::stem", config.input_dim, hidden).map_err(MocoError::from)?);
            stem.push(Relu::new());
            let fc = Linear::new("encoder::fc", hidden, config.emb_dim).map_err(MocoError::from)?;
            EncoderNet::new(stem, hidden, fc)
        });
        factory
    }

    /// Registers (or replaces) a named backbone builder.
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&MocoConfig) -> Result<EncoderNet> + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Box::new(builder));
    }

    /// Builds one fresh encoder for the configured backbone name.
    pub fn build(&self, config: &MocoConfig) -> Result<EncoderNet> {
        let builder = self.builders.get(&config.base_encoder).ok_or_else(|| {
            MocoError::InvalidArgument(format!("unknown backbone: {}", config.base_encoder))
        })?;
        let encoder = builder(config)?;
        if encoder.embedding_dim() != config.emb_dim {
            return Err(MocoError::Shape(format!(
                "backbone {} produced embedding dim {}, expected {}",
                config.base_encoder,
                encoder.embedding_dim(),
                config.emb_dim
            )));
        }
        Ok(encoder)
    }
}

/// Query/key encoder pair with momentum-only updates on the key side.
///
/// The key encoder never sees a backward pass and is never handed to the
/// optimizer; its parameters change exclusively through [`Self::momentum_update`].
#[derive(Debug)]
pub struct EncoderPair {
    query: EncoderNet,
    key: EncoderNet,
}

impl EncoderPair {
    /// Builds both encoders from the same builder, optionally widens their
    /// heads, then copies the query parameters into the key encoder.
    pub fn new(factory: &BackboneFactory, config: &MocoConfig) -> Result<Self> {
        let mut query = factory.build(config)?;
        let mut key = factory.build(config)?;
        if config.use_mlp {
            query.widen_head()?;
            key.widen_head()?;
        }
        let state = query.state_dict().map_err(MocoError::from)?;
        key.load_state_dict(&state).map_err(MocoError::from)?;
        Ok(Self { query, key })
    }

    /// Query encoder, updated by gradient descent.
    pub fn query(&self) -> &EncoderNet {
        &self.query
    }

    /// Mutable query encoder for backward passes and optimizer steps.
    pub fn query_mut(&mut self) -> &mut EncoderNet {
        &mut self.query
    }

    /// Key encoder, updated only by the momentum blend.
    pub fn key(&self) -> &EncoderNet {
        &self.key
    }

    /// Blends query weights into the key encoder:
    /// `key <- key * m + query * (1 - m)`, element-wise per parameter pair.
    pub fn momentum_update(&mut self, momentum: f32) -> Result<()> {
        if !(0.0..1.0).contains(&momentum) {
            return Err(MocoError::InvalidArgument(format!(
                "encoder momentum must lie in [0, 1), got {momentum}"
            )));
        }
        let source = self.query.state_dict().map_err(MocoError::from)?;
        self.key
            .visit_parameters_mut(&mut |param| {
                let Some(query_value) = source.get(param.name()) else {
                    return Err(mc_tensor::TensorError::MissingParameter {
                        name: param.name().to_string(),
                    });
                };
                for (key_value, &query_value) in param
                    .value_mut()
                    .data_mut()
                    .iter_mut()
                    .zip(query_value.data().iter())
                {
                    *key_value = *key_value * momentum + query_value * (1.0 - momentum);
                }
                Ok(())
            })
            .map_err(MocoError::from)
    }
}
