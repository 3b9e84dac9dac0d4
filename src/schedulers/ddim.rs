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

use ndarray::{Array1, Array4, ArrayView1, ArrayView4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;

use super::{predict_original_sample, uniform_timesteps, DiffusionScheduler, NoiseSchedule, SchedulerStepOutput};

/// Additional configuration for the [`DDIMScheduler`].
#[derive(Debug, Clone)]
pub struct DDIMSchedulerConfig {
	/// Option to clip the predicted sample between -1 and 1 for numerical stability.
	pub clip_sample: bool,
	/// Each diffusion step uses the value of alphas product at that step and at the previous one. For the final step,
	/// there is no previous alpha. When this option is true, the previous alpha product is fixed to `1`, otherwise it
	/// uses the value of alpha at step 0, as latent diffusion does.
	pub set_alpha_to_one: bool,
	/// Amount of noise injected at each step. `0.0` gives a deterministic trajectory, `1.0` matches DDPM.
	pub eta: f32
}

impl Default for DDIMSchedulerConfig {
	fn default() -> Self {
		Self {
			clip_sample: false,
			set_alpha_to_one: false,
			eta: 0.0
		}
	}
}

/// [Denoising diffusion implicit models][ddim] is a scheduler that extends the denoising procedure introduced in
/// denoising diffusion probabilistic models (DDPMs) with non-Markovian guidance.
///
/// [ddim]: https://arxiv.org/abs/2010.02502
#[derive(Clone)]
pub struct DDIMScheduler {
	alphas_cumprod: Array1<f32>,
	final_alpha_cumprod: f32,
	timesteps: Array1<usize>,
	num_train_timesteps: usize,
	num_inference_steps: usize,
	config: DDIMSchedulerConfig
}

impl DDIMScheduler {
	/// Creates a new instance of the scheduler over the given noise schedule.
	pub fn new(schedule: &NoiseSchedule, config: Option<DDIMSchedulerConfig>) -> Self {
		let config = config.unwrap_or_default();
		let alphas_cumprod = schedule.alphas_cumprod().to_owned();
		let num_train_timesteps = schedule.len();

		// At every step in DDIM, we are looking into the previous alphas_cumprod
		// For the final step, there is no previous alphas_cumprod because we are already at 0
		let final_alpha_cumprod = if config.set_alpha_to_one { 1.0 } else { alphas_cumprod[0] };

		Self {
			alphas_cumprod,
			final_alpha_cumprod,
			timesteps: uniform_timesteps(num_train_timesteps, num_train_timesteps),
			num_train_timesteps,
			num_inference_steps: num_train_timesteps,
			config
		}
	}

	fn step_ratio(&self) -> usize {
		(self.num_train_timesteps / self.num_inference_steps).max(1)
	}

	fn alpha_prod_prev(&self, prev_timestep: isize) -> f32 {
		if prev_timestep >= 0 {
			self.alphas_cumprod[prev_timestep as usize]
		} else {
			self.final_alpha_cumprod
		}
	}

	fn get_variance(&self, timestep: usize, prev_timestep: isize) -> f32 {
		let alpha_prod_t = self.alphas_cumprod[timestep];
		let alpha_prod_t_prev = self.alpha_prod_prev(prev_timestep);
		let beta_prod_t = 1.0 - alpha_prod_t;
		let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

		(beta_prod_t_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_t_prev)
	}
}

impl DiffusionScheduler for DDIMScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) {
		self.num_inference_steps = num_inference_steps.max(1);
		self.timesteps = uniform_timesteps(self.num_train_timesteps, self.num_inference_steps);
	}

	fn set_eta(&mut self, eta: f32) -> bool {
		self.config.eta = eta;
		true
	}

	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, timestep: usize, sample: ArrayView4<'_, f32>, rng: &mut R) -> SchedulerStepOutput {
		// 1. get previous step value (=t-1)
		let prev_timestep = timestep as isize - self.step_ratio() as isize;

		// 2. compute alphas, betas
		let alpha_prod_t = self.alphas_cumprod[timestep];
		let alpha_prod_t_prev = self.alpha_prod_prev(prev_timestep);

		// 3. compute predicted original sample from predicted noise - also called "predicted x_0" of formula (12)
		let mut pred_original_sample = predict_original_sample(sample, model_output, alpha_prod_t);

		// 4. clip predicted x_0
		if self.config.clip_sample {
			pred_original_sample.par_map_inplace(|f| *f = f.clamp(-1.0, 1.0));
		}

		// 5. compute variance: "sigma_t(η)" -> see formula (16)
		// σ_t = sqrt((1 − α_t−1)/(1 − α_t)) * sqrt(1 − α_t/α_t−1)
		let eta = self.config.eta;
		let std_dev_t = eta * self.get_variance(timestep, prev_timestep).sqrt();

		// 6. compute direction pointing to x_t of formula (12)
		let pred_sample_direction = (1.0 - alpha_prod_t_prev - std_dev_t.powi(2)).max(0.0).sqrt() * &model_output;

		// 7. compute x_t without random noise of formula (12)
		let mut prev_sample = alpha_prod_t_prev.sqrt() * &pred_original_sample + pred_sample_direction;

		if eta > 0.0 {
			let variance_noise = Array4::<f32>::random_using(model_output.raw_dim(), StandardNormal, rng);
			prev_sample = prev_sample + std_dev_t * variance_noise;
		}

		SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		}
	}

	fn timesteps(&self) -> ArrayView1<'_, usize> {
		self.timesteps.view()
	}

	fn len(&self) -> usize {
		self.num_train_timesteps
	}
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;
	use rand::{rngs::StdRng, SeedableRng};

	use super::*;
	use crate::BetaSchedule;

	fn scheduler() -> DDIMScheduler {
		let schedule = NoiseSchedule::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear).unwrap();
		DDIMScheduler::new(&schedule, None)
	}

	#[test]
	fn test_ddim_timesteps() {
		let mut scheduler = scheduler();
		scheduler.set_timesteps(50);
		assert_eq!(scheduler.timesteps().len(), 50);
		assert_eq!(scheduler.timesteps()[0], 981);
		assert_eq!(scheduler.timesteps()[49], 1);
	}

	#[test]
	fn test_ddim_zero_eta_is_deterministic() {
		let mut scheduler = scheduler();
		scheduler.set_timesteps(10);
		let sample = Array4::<f32>::from_elem((1, 4, 2, 2), 0.5);
		let eps = Array4::<f32>::from_elem((1, 4, 2, 2), 0.1);
		let a = scheduler.step(eps.view(), 901, sample.view(), &mut StdRng::seed_from_u64(1));
		let b = scheduler.step(eps.view(), 901, sample.view(), &mut StdRng::seed_from_u64(2));
		assert_eq!(a.prev_sample(), b.prev_sample());
		assert!(a.pred_original_sample().is_some());
	}

	#[test]
	fn test_ddim_eta_injects_noise() {
		let mut scheduler = scheduler();
		scheduler.set_timesteps(10);
		assert!(scheduler.set_eta(1.0));
		let sample = Array4::<f32>::from_elem((1, 4, 2, 2), 0.5);
		let eps = Array4::<f32>::from_elem((1, 4, 2, 2), 0.1);
		let a = scheduler.step(eps.view(), 901, sample.view(), &mut StdRng::seed_from_u64(1));
		let b = scheduler.step(eps.view(), 901, sample.view(), &mut StdRng::seed_from_u64(2));
		assert_ne!(a.prev_sample(), b.prev_sample());
	}

	#[test]
	fn test_ddim_recovers_clean_sample() {
		// with a perfect noise prediction, the last step lands exactly on x_0 scaled by sqrt(alpha_0)
		let mut scheduler = scheduler();
		scheduler.set_timesteps(10);
		let x0 = Array4::<f32>::from_elem((1, 1, 1, 1), 0.25);
		let eps = Array4::<f32>::from_elem((1, 1, 1, 1), -0.5);
		let a = scheduler.alphas_cumprod[1];
		let x_t = a.sqrt() * &x0 + (1.0 - a).sqrt() * &eps;
		let out = scheduler.step(eps.view(), 1, x_t.view(), &mut StdRng::seed_from_u64(0));
		let pred = out.pred_original_sample().unwrap();
		assert!((pred[[0, 0, 0, 0]] - 0.25).abs() < 1e-4);
	}
}
