//! Gaussian noise injection (random self-ensemble).
//!
//! Unlike dropout, the noise stays on in evaluation mode: every forward pass
//! sees a fresh draw, so repeated predictions form an implicit ensemble.

use candle_core::{Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Noise {
    std: f64,
}

impl Noise {
    pub fn new(std: f64) -> Self {
        Self { std }
    }

    pub fn is_active(&self) -> bool {
        self.std > 0.0
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if !self.is_active() {
            return Ok(x.clone());
        }
        let eps = x.randn_like(0.0, self.std)?;
        x.add(&eps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn zero_std_is_identity() {
        let x = Tensor::new(&[1f32, -2., 3.], &Device::Cpu).unwrap();
        let y = Noise::new(0.0).forward(&x).unwrap();
        assert_eq!(y.to_vec1::<f32>().unwrap(), vec![1., -2., 3.]);
    }

    #[test]
    fn positive_std_perturbs() {
        let x = Tensor::zeros(256, candle_core::DType::F32, &Device::Cpu).unwrap();
        let y = Noise::new(0.5).forward(&x).unwrap();
        let v = y.to_vec1::<f32>().unwrap();
        assert!(v.iter().any(|&a| a != 0.0));
    }
}
