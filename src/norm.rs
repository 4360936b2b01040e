//! Layer normalization built from differentiable tensor ops.
//!
//! ```text
//! y = weight * (x - mean) / sqrt(var + eps) + bias
//! ```
//!
//! Statistics are taken over the last dimension. Every step is a primitive
//! tensor op, so gradients reach the input, `weight` and `bias`.

use candle_core::{Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::error::{Error, Result};

/// Learned affine layer normalization over the last dimension.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
    dim: usize,
}

impl LayerNorm {
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let width = x.dim(D::Minus1)?;
        if width != self.dim {
            return Err(Error::DimensionMismatch {
                what: "layer norm width",
                expected: self.dim,
                got: width,
            });
        }
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (variance + self.eps)?.sqrt()?;
        let normed = centered.broadcast_div(&std)?;
        Ok(normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// `weight` starts at one and `bias` at zero.
pub fn layer_norm(dim: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    if dim == 0 {
        return Err(Error::InvalidConfig("layer norm width must be positive".into()));
    }
    Ok(LayerNorm {
        weight: vb.get_with_hints(dim, "weight", Init::Const(1.0))?,
        bias: vb.get_with_hints(dim, "bias", Init::Const(0.0))?,
        eps,
        dim,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn test_rows_are_standardized() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = layer_norm(4, 1e-5, vb).unwrap();

        let x = Tensor::new(&[[1f32, 2., 3., 4.], [-3., 0., 0., 3.]], &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap();
        let mean = y.mean(D::Minus1).unwrap().to_vec1::<f32>().unwrap();
        let var = y.sqr().unwrap().mean(D::Minus1).unwrap().to_vec1::<f32>().unwrap();
        for (m, v) in mean.iter().zip(&var) {
            assert!(m.abs() < 1e-5);
            assert!((v - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_gradients_reach_input_and_parameters() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = layer_norm(3, 1e-5, vb).unwrap();

        let x = Var::from_tensor(&Tensor::new(&[[0.5f32, -1., 2.], [3., 1., -2.]], &device).unwrap()).unwrap();
        // Weighted sum so the input gradient is not identically zero.
        let w = Tensor::new(&[1f32, 2., -1.], &device).unwrap();
        let loss = norm.forward(x.as_tensor()).unwrap().broadcast_mul(&w).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        let gx = grads.get(x.as_tensor()).expect("input gradient");
        assert!(gx.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() > 0.0);
        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn test_rejects_wrong_width() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = layer_norm(4, 1e-5, vb).unwrap();
        let x = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(norm.forward(&x), Err(Error::DimensionMismatch { .. })));
    }
}
