//! Dropout with keep-masks drawn from a caller-owned RNG.
//!
//! Every forward pass in this crate takes `rng: Option<&mut StdRng>`:
//! `None` is inference and dropout is the identity; `Some(rng)` is training
//! and masks are drawn from `rng` in a fixed order. Two training passes that
//! start from equally seeded generators therefore produce identical outputs.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{Error, Result};

/// Inverted dropout: kept elements are scaled by `1 / (1 - p)`.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::InvalidConfig(format!("dropout must be in [0, 1), got {p}")));
        }
        Ok(Self { p })
    }

    pub fn probability(&self) -> f32 {
        self.p
    }

    pub fn forward(&self, xs: &Tensor, rng: Option<&mut StdRng>) -> Result<Tensor> {
        let rng = match rng {
            Some(rng) if self.p > 0.0 => rng,
            _ => return Ok(xs.clone()),
        };
        let scale = 1.0 / (1.0 - self.p);
        let keep: Vec<f32> = (0..xs.elem_count())
            .map(|_| if rng.random::<f32>() < self.p { 0.0 } else { scale })
            .collect();
        let mask = Tensor::from_vec(keep, xs.dims(), xs.device())?.to_dtype(xs.dtype())?;
        Ok((xs * mask)?)
    }
}
