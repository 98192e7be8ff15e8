use core::fmt;
use std::sync::Mutex;

use tracing::debug;

use super::net::wire::Tensor;

/// Opaque failure raised by a nucleus. The mesh treats the transform as a
/// black box, so there is nothing more structured to say about it.
#[derive(Debug, Clone, PartialEq)]
pub struct NucleusError(pub String);

impl fmt::Display for NucleusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The local transform a node runs between its upstream caller and its
/// downstream peers.
///
/// All methods take `&self`; implementations keep their parameters behind
/// interior mutability so one nucleus can serve concurrent passes.
pub trait Nucleus: Send + Sync + 'static {
    /// Forward: combine the upstream activation with the k downstream
    /// responses (zero-filled at dead positions) into this node's output.
    /// Output shape must depend only on the input shapes.
    fn spike(
        &self,
        uspikes: &Tensor,
        dspikes: &[Tensor],
    ) -> Result<Tensor, NucleusError>;

    /// Backward: split the upstream gradient into exactly
    /// `dspikes.len()` downstream gradients plus this node's local gradient.
    fn grade(
        &self,
        ugrades: &Tensor,
        uspikes: &Tensor,
        dspikes: &[Tensor],
    ) -> Result<(Vec<Tensor>, Tensor), NucleusError>;

    /// Apply an accumulated local gradient to the parameters.
    fn learn(&self, lgrads: &Tensor) -> Result<(), NucleusError>;
}

/// Minimal learnable nucleus: a single scalar gain over the sum of the
/// upstream row mean and the downstream responses. Ships for the demo and
/// the loopback tests, not as a serious model.
pub struct GainNucleus {
    gain: Mutex<f32>,
    feature_dim: u32,
}

impl GainNucleus {
    pub fn new(gain: f32, feature_dim: u32) -> Self {
        Self {
            gain: Mutex::new(gain),
            feature_dim,
        }
    }

    pub fn gain(&self) -> f32 {
        *self.gain.lock().unwrap()
    }
}

impl Nucleus for GainNucleus {
    fn spike(
        &self,
        uspikes: &Tensor,
        dspikes: &[Tensor],
    ) -> Result<Tensor, NucleusError> {
        for d in dspikes {
            if d.rows != uspikes.rows || d.cols != self.feature_dim {
                return Err(NucleusError(format!(
                    "downstream response is {}x{}, expected {}x{}",
                    d.rows, d.cols, uspikes.rows, self.feature_dim
                )));
            }
        }
        let gain = self.gain();
        let rows = uspikes.rows as usize;
        let cols = self.feature_dim as usize;
        let mut out = Tensor::zeros(uspikes.rows, self.feature_dim);
        for r in 0..rows {
            let row = &uspikes.data
                [r * uspikes.cols as usize..(r + 1) * uspikes.cols as usize];
            let mean = if row.is_empty() {
                0.0
            } else {
                row.iter().sum::<f32>() / row.len() as f32
            };
            for c in 0..cols {
                let mut v = mean;
                for d in dspikes {
                    v += d.data[r * cols + c];
                }
                out.data[r * cols + c] = gain * v;
            }
        }
        Ok(out)
    }

    fn grade(
        &self,
        ugrades: &Tensor,
        _uspikes: &Tensor,
        dspikes: &[Tensor],
    ) -> Result<(Vec<Tensor>, Tensor), NucleusError> {
        let gain = self.gain();
        let dgrades = dspikes
            .iter()
            .map(|_| {
                let mut g = ugrades.clone();
                for v in &mut g.data {
                    *v *= gain;
                }
                g
            })
            .collect();
        let mean = if ugrades.data.is_empty() {
            0.0
        } else {
            ugrades.data.iter().sum::<f32>() / ugrades.data.len() as f32
        };
        Ok((dgrades, Tensor::new(1, 1, vec![mean])))
    }

    fn learn(&self, lgrads: &Tensor) -> Result<(), NucleusError> {
        let step = lgrads
            .data
            .first()
            .ok_or_else(|| NucleusError("empty local gradient".into()))?;
        let mut gain = self.gain.lock().unwrap();
        *gain -= 0.01 * step;
        debug!(gain = *gain, "applied local gradient");
        Ok(())
    }
}
