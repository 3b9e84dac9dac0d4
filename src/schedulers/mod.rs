// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The schedule functions, denoted Schedulers in the library, take in the output of a trained model, a sample which the
//! diffusion process is iterating on, and a timestep to return a denoised sample.
//!
//! * Schedulers define how to update a sample based on an output from a pretrained model.
//! * Schedulers are defined by a noise schedule (shared with the model, see [`NoiseSchedule`]) and an update rule to
//!   solve the differential equation solution.

use ndarray::{Array1, Array4, ArrayBase, ArrayView1, ArrayView4};
use rand::Rng;

mod ddim;
mod dpm_solver_multistep;
mod plms;

pub use self::ddim::*;
pub use self::dpm_solver_multistep::*;
pub use self::plms::*;

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Debug, Clone)]
pub enum BetaSchedule {
	/// Linear beta schedule.
	Linear,
	/// Scaled linear beta schedule: linear in `sqrt(beta)`. This is what latent diffusion calls its "linear" schedule.
	ScaledLinear,
	/// Pre-trained betas.
	TrainedBetas(Array1<f32>)
}

/// The forward noising process a model was trained with, expressed as the cumulative product of `alpha = 1 - beta`.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
	alphas_cumprod: Array1<f32>
}

impl NoiseSchedule {
	/// Creates a new noise schedule.
	///
	/// # Errors
	/// Can error if:
	/// - `num_train_timesteps` is 0
	/// - `beta_start` or `beta_end` are not normal numbers (not zero, infinite, `NaN`, or subnormal)
	/// - `beta_end` is less than or equal to `beta_start`
	/// - trained betas are given whose length doesn't match `num_train_timesteps`
	pub fn new(num_train_timesteps: usize, beta_start: f32, beta_end: f32, beta_schedule: &BetaSchedule) -> anyhow::Result<Self> {
		if num_train_timesteps == 0 {
			anyhow::bail!("num_train_timesteps ({num_train_timesteps}) must be >0");
		}
		if !beta_start.is_normal() || !beta_end.is_normal() {
			anyhow::bail!("beta_start ({beta_start}) and beta_end ({beta_end}) must be normal (not zero, infinite, NaN, or subnormal)");
		}
		if beta_start >= beta_end {
			anyhow::bail!("beta_start must be < beta_end");
		}

		let betas = match beta_schedule {
			BetaSchedule::TrainedBetas(betas) => {
				if betas.len() != num_train_timesteps {
					anyhow::bail!("expected {num_train_timesteps} trained betas, got {}", betas.len());
				}
				betas.clone()
			}
			BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, num_train_timesteps),
			BetaSchedule::ScaledLinear => {
				let mut betas = Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps);
				betas.par_map_inplace(|f| *f = f.powi(2));
				betas
			}
		};

		let alphas = 1.0 - betas;
		let alphas_cumprod = alphas
			.view()
			.into_iter()
			.scan(1.0, |prod, alpha| {
				*prod *= *alpha;
				Some(*prod)
			})
			.collect::<Array1<_>>();

		Ok(Self { alphas_cumprod })
	}

	/// The cumulative product of alphas, indexed by training timestep.
	pub fn alphas_cumprod(&self) -> ArrayView1<'_, f32> {
		self.alphas_cumprod.view()
	}

	/// Returns the number of train timesteps.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.alphas_cumprod.len()
	}
}

/// The timesteps latent diffusion samples on when asked for `num_inference_steps` steps: every `T / steps`-th train
/// timestep, offset by one so the final step lands on timestep 1. Only meaningful for `num_inference_steps <
/// num_train_timesteps`, which samplers check before sampling.
pub(crate) fn uniform_timesteps(num_train_timesteps: usize, num_inference_steps: usize) -> Array1<usize> {
	let step_ratio = (num_train_timesteps / num_inference_steps).max(1);
	(0..num_inference_steps)
		.rev()
		.map(|i| (i * step_ratio + 1).min(num_train_timesteps - 1))
		.collect()
}

/// The output returned by a scheduler's `step` function.
pub struct SchedulerStepOutput {
	pub(crate) prev_sample: Array4<f32>,
	pub(crate) pred_original_sample: Option<Array4<f32>>
}

impl SchedulerStepOutput {
	/// Computed sample (`x_{t-1}`) of the previous timestep. `prev_sample` should be used as the next model input in
	/// the denoising loop.
	pub fn prev_sample(&self) -> ArrayView4<'_, f32> {
		self.prev_sample.view()
	}

	/// The predicted denoised sample (`x_{0}`) based on the model output from the current timestep.
	/// `pred_original_sample` can be used to preview progress or for guidance.
	pub fn pred_original_sample(&self) -> Option<ArrayView4<'_, f32>> {
		self.pred_original_sample.as_ref().map(ArrayBase::view)
	}
}

/// Predicts `x_0` from a noise prediction: `(x_t - sqrt(1 - a_t) * eps) / sqrt(a_t)`.
pub(crate) fn predict_original_sample(sample: ArrayView4<'_, f32>, model_output: ArrayView4<'_, f32>, alpha_prod_t: f32) -> Array4<f32> {
	let noise = (1.0 - alpha_prod_t).sqrt() * &model_output;
	(&sample - &noise) / alpha_prod_t.sqrt()
}

/// A scheduler to be used by a [`crate::Sampler`].
#[allow(clippy::len_without_is_empty)]
pub trait DiffusionScheduler: Clone {
	/// Sets the number of inference steps. This should be called before `step` to properly compute the timesteps.
	fn set_timesteps(&mut self, num_inference_steps: usize);

	/// Sets the stochasticity of the update rule. Returns `false` if this scheduler has no notion of `eta`, in which
	/// case the value is ignored.
	fn set_eta(&mut self, _eta: f32) -> bool {
		false
	}

	/// Predict the sample at the previous timestep by reversing the SDE. Core function to propagate the diffusion
	/// process from the learned model outputs (most often the predicted noise).
	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, timestep: usize, sample: ArrayView4<'_, f32>, rng: &mut R) -> SchedulerStepOutput;

	/// Returns the computed scheduler timesteps, in the order the model should be evaluated.
	fn timesteps(&self) -> ArrayView1<'_, usize>;

	/// Returns the initial sigma noise value.
	fn init_noise_sigma(&self) -> f32 {
		1.0
	}

	/// Returns the number of train timesteps.
	fn len(&self) -> usize;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_scaled_linear_schedule() {
		let schedule = NoiseSchedule::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear).unwrap();
		assert_eq!(schedule.len(), 1000);
		let alphas_cumprod = schedule.alphas_cumprod();
		assert!((alphas_cumprod[0] - (1.0 - 0.00085)).abs() < 1e-6);
		assert!(alphas_cumprod.windows(2).into_iter().all(|w| w[1] < w[0]));
		// SD v1 ends at roughly 0.0047
		assert!((alphas_cumprod[999] - 0.0047).abs() < 1e-3);
	}

	#[test]
	fn test_reject_bad_betas() {
		assert!(NoiseSchedule::new(0, 0.00085, 0.012, &BetaSchedule::Linear).is_err());
		assert!(NoiseSchedule::new(1000, 0.012, 0.00085, &BetaSchedule::Linear).is_err());
		assert!(NoiseSchedule::new(1000, 0.0, 0.012, &BetaSchedule::Linear).is_err());
		assert!(NoiseSchedule::new(10, 0.001, 0.01, &BetaSchedule::TrainedBetas(Array1::zeros(5))).is_err());
	}

	#[test]
	fn test_uniform_timesteps() {
		assert_eq!(uniform_timesteps(1000, 50).to_vec()[..3], [981, 961, 941]);
		assert_eq!(*uniform_timesteps(1000, 50).last().unwrap(), 1);
		assert_eq!(uniform_timesteps(1000, 4).to_vec(), vec![751, 501, 251, 1]);
	}
}
