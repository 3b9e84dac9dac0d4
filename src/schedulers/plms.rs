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

use std::collections::VecDeque;

use ndarray::{concatenate, Array1, Array4, ArrayView1, ArrayView4, Axis};
use rand::Rng;

use super::{predict_original_sample, uniform_timesteps, DiffusionScheduler, NoiseSchedule, SchedulerStepOutput};

/// Pseudo linear multi-step (PLMS) sampling from [Pseudo Numerical Methods for Diffusion Models on Manifolds][pndm].
///
/// Each step combines up to four previous noise predictions with Adams-Bashforth coefficients. The very first step has
/// no history, so it is taken twice: once to get a provisional `x_{t-1}`, and once more with the average of the noise
/// predicted at `t` and at the provisional `x_{t-1}`. [`DiffusionScheduler::timesteps`] therefore contains one more
/// entry than the requested number of inference steps.
///
/// [pndm]: https://arxiv.org/abs/2202.09778
#[derive(Clone)]
pub struct PLMSScheduler {
	alphas_cumprod: Array1<f32>,
	final_alpha_cumprod: f32,
	timesteps: Array1<usize>,
	num_train_timesteps: usize,
	num_inference_steps: usize,
	ets: VecDeque<Array4<f32>>,
	cur_sample: Option<Array4<f32>>,
	counter: usize
}

impl PLMSScheduler {
	/// Creates a new instance of the scheduler over the given noise schedule.
	pub fn new(schedule: &NoiseSchedule) -> Self {
		let alphas_cumprod = schedule.alphas_cumprod().to_owned();
		let num_train_timesteps = schedule.len();
		let mut scheduler = Self {
			final_alpha_cumprod: alphas_cumprod[0],
			alphas_cumprod,
			timesteps: Array1::zeros(0),
			num_train_timesteps,
			num_inference_steps: num_train_timesteps,
			ets: VecDeque::with_capacity(4),
			cur_sample: None,
			counter: 0
		};
		scheduler.set_timesteps(num_train_timesteps);
		scheduler
	}

	fn step_ratio(&self) -> usize {
		(self.num_train_timesteps / self.num_inference_steps).max(1)
	}

	fn alpha_prod(&self, timestep: isize) -> f32 {
		if timestep >= 0 {
			self.alphas_cumprod[timestep as usize]
		} else {
			self.final_alpha_cumprod
		}
	}

	/// See formula (9) of the PNDM paper: `x_{t-δ} = φ(x_t, ε_t, t, t-δ)`.
	fn get_prev_sample(&self, sample: ArrayView4<'_, f32>, timestep: usize, prev_timestep: isize, model_output: ArrayView4<'_, f32>) -> Array4<f32> {
		let alpha_prod_t = self.alphas_cumprod[timestep];
		let alpha_prod_t_prev = self.alpha_prod(prev_timestep);
		let beta_prod_t = 1.0 - alpha_prod_t;
		let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

		let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
		let model_output_denom_coeff = alpha_prod_t * beta_prod_t_prev.sqrt() + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();

		let scaled_output = ((alpha_prod_t_prev - alpha_prod_t) / model_output_denom_coeff) * &model_output;
		sample_coeff * &sample - scaled_output
	}
}

impl DiffusionScheduler for PLMSScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) {
		self.num_inference_steps = num_inference_steps.max(1);
		let timesteps = uniform_timesteps(self.num_train_timesteps, self.num_inference_steps);
		// repeat the second timestep so the warm-up step can be evaluated twice
		self.timesteps = if timesteps.len() > 1 {
			concatenate![Axis(0), timesteps.slice(ndarray::s![..2]), timesteps.slice(ndarray::s![1..])]
		} else {
			timesteps
		};
		self.ets.clear();
		self.cur_sample = None;
		self.counter = 0;
	}

	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, timestep: usize, sample: ArrayView4<'_, f32>, _: &mut R) -> SchedulerStepOutput {
		let step_ratio = self.step_ratio();
		let mut timestep = timestep;
		let mut prev_timestep = timestep as isize - step_ratio as isize;

		if self.counter != 1 {
			while self.ets.len() > 3 {
				self.ets.pop_front();
			}
			self.ets.push_back(model_output.to_owned());
		} else {
			prev_timestep = timestep as isize;
			timestep += step_ratio;
		}

		let mut sample = sample.to_owned();
		let ets = &self.ets;
		let model_output = match (ets.len(), self.counter) {
			(1, 0) => {
				self.cur_sample = Some(sample.clone());
				model_output.to_owned()
			}
			(1, 1) => {
				if let Some(cur_sample) = self.cur_sample.take() {
					sample = cur_sample;
				}
				(&model_output + &ets[0]) / 2.0
			}
			(2, _) => (3.0 * &ets[1] - &ets[0]) / 2.0,
			(3, _) => (23.0 * &ets[2] - 16.0 * &ets[1] + 5.0 * &ets[0]) / 12.0,
			_ => {
				let n = ets.len();
				(55.0 * &ets[n - 1] - 59.0 * &ets[n - 2] + 37.0 * &ets[n - 3] - 9.0 * &ets[n - 4]) / 24.0
			}
		};

		let pred_original_sample = predict_original_sample(sample.view(), model_output.view(), self.alphas_cumprod[timestep]);
		let prev_sample = self.get_prev_sample(sample.view(), timestep, prev_timestep, model_output.view());
		self.counter += 1;

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
