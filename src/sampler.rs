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

//! Samplers turn Gaussian noise into latents by repeatedly querying a [`LatentDiffusion`] model.

use std::fmt;

use ndarray::{concatenate, s, Array4, ArrayView3, ArrayView4, Axis};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::{DDIMScheduler, DPMSolverMultistepScheduler, DiffusionScheduler, LatentDiffusion, PLMSScheduler};

/// The sampling strategy to use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SamplerKind {
	/// Denoising diffusion implicit models. The only sampler that honors `eta`.
	#[default]
	Ddim,
	/// Pseudo linear multi-step.
	Plms,
	/// Multistep DPM-Solver++ (second order).
	DpmSolver
}

impl fmt::Display for SamplerKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Ddim => "DDIM",
			Self::Plms => "PLMS",
			Self::DpmSolver => "DPM-Solver"
		})
	}
}

impl SamplerKind {
	/// Binds a sampler of this kind to `model`.
	pub fn build<'m, M: LatentDiffusion + ?Sized>(self, model: &'m M) -> anyhow::Result<Box<dyn Sampler + 'm>> {
		let schedule = model.schedule();
		Ok(match self {
			Self::Ddim => Box::new(DiffusionSampler::new(self, model, DDIMScheduler::new(schedule, None))),
			Self::Plms => Box::new(DiffusionSampler::new(self, model, PLMSScheduler::new(schedule))),
			Self::DpmSolver => Box::new(DiffusionSampler::new(self, model, DPMSolverMultistepScheduler::new(schedule, None)?))
		})
	}
}

/// Receives the intermediate latents of every denoising step.
pub trait StepAccumulator {
	/// Called once per step with the running trajectory `x_{t-1}` and the current estimate of the denoised latent.
	fn append(&mut self, trajectory: ArrayView4<'_, f32>, denoised: ArrayView4<'_, f32>);
}

/// Discards every step.
impl StepAccumulator for () {
	fn append(&mut self, _: ArrayView4<'_, f32>, _: ArrayView4<'_, f32>) {}
}

/// Keeps every step of one sampling call, to be rendered as preview frames afterwards.
#[derive(Debug, Default, Clone)]
pub struct StepTrace {
	/// `x_{t-1}` after each step.
	pub trajectory: Vec<Array4<f32>>,
	/// Predicted `x_0` at each step.
	pub denoised: Vec<Array4<f32>>
}

impl StepTrace {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.trajectory.len()
	}

	pub fn is_empty(&self) -> bool {
		self.trajectory.is_empty()
	}
}

impl StepAccumulator for StepTrace {
	fn append(&mut self, trajectory: ArrayView4<'_, f32>, denoised: ArrayView4<'_, f32>) {
		self.trajectory.push(trajectory.to_owned());
		self.denoised.push(denoised.to_owned());
	}
}

/// Inputs to a single [`Sampler::sample`] call.
#[derive(Debug, Clone)]
pub struct SampleOptions<'a> {
	/// Number of denoising steps.
	pub steps: usize,
	/// Prompt conditioning, `[batch_size, tokens, hidden]`.
	pub conditioning: ArrayView3<'a, f32>,
	pub batch_size: usize,
	/// Latent shape without the batch dimension, `[channels, height / f, width / f]`.
	pub shape: [usize; 3],
	/// Classifier-free guidance scale. `1.0` disables guidance.
	pub guidance_scale: f32,
	/// Empty-prompt conditioning, required for guidance.
	pub unconditional_conditioning: Option<ArrayView3<'a, f32>>,
	/// Noise injected per step. Only meaningful for DDIM.
	pub eta: f32,
	/// Starting noise. When `None`, fresh noise is drawn from the sampler's RNG.
	pub x_t: Option<ArrayView4<'a, f32>>,
	/// How often to record [`SampleIntermediates`].
	pub log_every_t: usize
}

impl<'a> SampleOptions<'a> {
	pub fn new(steps: usize, conditioning: ArrayView3<'a, f32>, shape: [usize; 3]) -> Self {
		Self {
			steps,
			batch_size: conditioning.shape()[0],
			conditioning,
			shape,
			guidance_scale: 1.0,
			unconditional_conditioning: None,
			eta: 0.0,
			x_t: None,
			log_every_t: 100
		}
	}
}

/// A sparse record of the sampling trajectory, every `log_every_t` steps plus the final step.
#[derive(Debug, Default, Clone)]
pub struct SampleIntermediates {
	pub x_inter: Vec<Array4<f32>>,
	pub pred_x0: Vec<Array4<f32>>
}

/// Produces latents from noise.
pub trait Sampler {
	/// The strategy this sampler implements.
	fn kind(&self) -> SamplerKind;

	/// Runs the full denoising loop, calling `accumulator` once per step.
	fn sample(&self, options: &SampleOptions<'_>, rng: &mut StdRng, accumulator: &mut dyn StepAccumulator) -> anyhow::Result<(Array4<f32>, SampleIntermediates)>;
}

/// A [`Sampler`] that drives a [`DiffusionScheduler`]. The scheduler passed in is a template: every call works on a
/// fresh clone, so calls don't influence each other.
pub struct DiffusionSampler<'m, M: LatentDiffusion + ?Sized, S: DiffusionScheduler> {
	kind: SamplerKind,
	model: &'m M,
	scheduler: S
}

impl<'m, M: LatentDiffusion + ?Sized, S: DiffusionScheduler> DiffusionSampler<'m, M, S> {
	pub fn new(kind: SamplerKind, model: &'m M, scheduler: S) -> Self {
		Self { kind, model, scheduler }
	}

	fn predict_noise(&self, x: &Array4<f32>, timestep: usize, options: &SampleOptions<'_>) -> anyhow::Result<Array4<f32>> {
		match options.unconditional_conditioning {
			Some(uc) if options.guidance_scale != 1.0 => {
				let x_in = concatenate![Axis(0), x.view(), x.view()];
				let c_in = concatenate![Axis(0), uc, options.conditioning];
				let noise_pred = self.model.apply_model(x_in.view(), timestep, c_in.view())?;

				anyhow::ensure!(noise_pred.shape()[0] % 2 == 0, "guided noise prediction has odd batch size {}", noise_pred.shape()[0]);
				let split_len = (noise_pred.shape()[0] / 2) as isize;
				let noise_pred_uncond = noise_pred.slice(s![..split_len, .., .., ..]);
				let noise_pred_text = noise_pred.slice(s![split_len.., .., .., ..]);
				let guidance = options.guidance_scale * &(&noise_pred_text - &noise_pred_uncond);
				Ok(&noise_pred_uncond + &guidance)
			}
			_ => self.model.apply_model(x.view(), timestep, options.conditioning)
		}
	}
}

impl<'m, M: LatentDiffusion + ?Sized, S: DiffusionScheduler> Sampler for DiffusionSampler<'m, M, S> {
	fn kind(&self) -> SamplerKind {
		self.kind
	}

	fn sample(&self, options: &SampleOptions<'_>, rng: &mut StdRng, accumulator: &mut dyn StepAccumulator) -> anyhow::Result<(Array4<f32>, SampleIntermediates)> {
		anyhow::ensure!(options.steps > 0, "cannot sample with 0 steps");
		anyhow::ensure!(
			options.conditioning.shape()[0] == options.batch_size,
			"conditioning batch ({}) doesn't match batch size ({})",
			options.conditioning.shape()[0],
			options.batch_size
		);

		let mut scheduler = self.scheduler.clone();
		// timesteps are `k * (T / steps) + 1`, which needs `steps < T` to stay inside the schedule
		anyhow::ensure!(
			options.steps < scheduler.len(),
			"cannot sample with {} steps, the model was trained on {} timesteps",
			options.steps,
			scheduler.len()
		);
		scheduler.set_timesteps(options.steps);
		if !scheduler.set_eta(options.eta) && options.eta != 0.0 {
			warn!("{} sampling ignores eta ({})", self.kind, options.eta);
		}

		let [channels, height, width] = options.shape;
		let latents_shape = (options.batch_size, channels, height, width);
		let mut latents = match options.x_t {
			Some(x_t) => {
				anyhow::ensure!(x_t.dim() == latents_shape, "initial noise has shape {:?}, expected {:?}", x_t.shape(), latents_shape);
				x_t.to_owned()
			}
			None => Array4::<f32>::random_using(latents_shape, StandardNormal, rng)
		};
		latents *= scheduler.init_noise_sigma();

		let timesteps = scheduler.timesteps().to_owned();
		debug!("running {} sampling with {} timesteps, shape {:?}", self.kind, timesteps.len(), latents_shape);

		let log_every_t = options.log_every_t.max(1);
		let mut intermediates = SampleIntermediates {
			x_inter: vec![latents.clone()],
			pred_x0: vec![latents.clone()]
		};

		// evaluations beyond one per step (PLMS warm-up) are provisional and belong to the step that follows them
		let provisional = timesteps.len().saturating_sub(options.steps);
		for (i, t) in timesteps.iter().enumerate() {
			let noise_pred = self.predict_noise(&latents, *t, options)?;
			let output = scheduler.step(noise_pred.view(), *t, latents.view(), rng);
			latents = output.prev_sample;
			let Some(step) = i.checked_sub(provisional) else {
				continue;
			};
			let denoised = output.pred_original_sample.unwrap_or_else(|| latents.clone());

			accumulator.append(latents.view(), denoised.view());

			if step % log_every_t == 0 || step == options.steps - 1 {
				intermediates.x_inter.push(latents.clone());
				intermediates.pred_x0.push(denoised);
			}
		}

		Ok((latents, intermediates))
	}
}

#[cfg(test)]
mod tests {
	use std::cell::Cell;

	use ndarray::{Array3, ArrayView3, ArrayView4};
	use rand::SeedableRng;

	use super::*;
	use crate::{BetaSchedule, NoiseSchedule};

	/// Predicts `x * 0.1 + mean(cond)` and counts calls.
	struct LinearModel {
		schedule: NoiseSchedule,
		calls: Cell<usize>,
		last_batch: Cell<usize>
	}

	impl LinearModel {
		fn new() -> Self {
			Self {
				schedule: NoiseSchedule::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear).unwrap(),
				calls: Cell::new(0),
				last_batch: Cell::new(0)
			}
		}
	}

	impl LatentDiffusion for LinearModel {
		fn learned_conditioning(&self, prompts: &[String]) -> anyhow::Result<Array3<f32>> {
			Ok(Array3::from_elem((prompts.len(), 2, 2), 1.0))
		}

		fn apply_model(&self, x: ArrayView4<'_, f32>, _: usize, conditioning: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
			self.calls.set(self.calls.get() + 1);
			self.last_batch.set(x.shape()[0]);
			let mut out = 0.1 * &x;
			for (mut sample, cond) in out.outer_iter_mut().zip(conditioning.outer_iter()) {
				sample += cond.mean().unwrap_or(0.0);
			}
			Ok(out)
		}

		fn decode_first_stage(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
			Ok(latents.to_owned())
		}

		fn schedule(&self) -> &NoiseSchedule {
			&self.schedule
		}
	}

	#[test]
	fn test_step_callback_once_per_step() {
		let model = LinearModel::new();
		let cond = Array3::<f32>::ones((2, 2, 2));
		for (kind, expected) in [(SamplerKind::Ddim, 5), (SamplerKind::Plms, 5), (SamplerKind::DpmSolver, 5)] {
			let sampler = kind.build(&model).unwrap();
			let mut trace = StepTrace::new();
			let options = SampleOptions::new(5, cond.view(), [4, 2, 2]);
			let (latents, _) = sampler.sample(&options, &mut StdRng::seed_from_u64(0), &mut trace).unwrap();
			assert_eq!(trace.len(), expected, "{kind}");
			assert_eq!(trace.denoised.len(), expected);
			assert_eq!(latents.shape(), &[2, 4, 2, 2]);
			assert_eq!(trace.trajectory.last().unwrap(), &latents);
		}
	}

	#[test]
	fn test_plms_warmup_evaluates_twice_but_reports_once() {
		let model = LinearModel::new();
		let cond = Array3::<f32>::ones((1, 2, 2));
		let sampler = SamplerKind::Plms.build(&model).unwrap();
		let mut trace = StepTrace::new();
		let mut options = SampleOptions::new(3, cond.view(), [1, 2, 2]);
		options.log_every_t = 1;
		let (_, intermediates) = sampler.sample(&options, &mut StdRng::seed_from_u64(0), &mut trace).unwrap();
		assert_eq!(model.calls.get(), 4);
		assert_eq!(trace.len(), 3);
		// initial noise plus one record per step
		assert_eq!(intermediates.x_inter.len(), 4);
	}

	#[test]
	fn test_reject_more_steps_than_timesteps() {
		let model = LinearModel::new();
		let cond = Array3::<f32>::ones((1, 2, 2));
		for kind in [SamplerKind::Ddim, SamplerKind::Plms, SamplerKind::DpmSolver] {
			let sampler = kind.build(&model).unwrap();
			for steps in [1000, 1500] {
				let err = sampler.sample(&SampleOptions::new(steps, cond.view(), [1, 2, 2]), &mut StdRng::seed_from_u64(0), &mut ()).unwrap_err();
				assert!(err.to_string().contains("1000 timesteps"), "{kind}");
			}
			assert!(sampler.sample(&SampleOptions::new(999, cond.view(), [1, 2, 2]), &mut StdRng::seed_from_u64(0), &mut ()).is_ok(), "{kind}");
		}
		// rejected calls never reach the model; PLMS spends one extra evaluation on its warm-up
		assert_eq!(model.calls.get(), 3 * 999 + 1);
	}

	#[test]
	fn test_guidance_doubles_batch() {
		let model = LinearModel::new();
		let cond = Array3::<f32>::ones((3, 2, 2));
		let uc = Array3::<f32>::zeros((3, 2, 2));
		let sampler = SamplerKind::Ddim.build(&model).unwrap();

		let mut options = SampleOptions::new(2, cond.view(), [4, 2, 2]);
		options.unconditional_conditioning = Some(uc.view());
		options.guidance_scale = 7.5;
		sampler.sample(&options, &mut StdRng::seed_from_u64(0), &mut ()).unwrap();
		assert_eq!(model.last_batch.get(), 6);
		assert_eq!(model.calls.get(), 2);

		options.guidance_scale = 1.0;
		sampler.sample(&options, &mut StdRng::seed_from_u64(0), &mut ()).unwrap();
		assert_eq!(model.last_batch.get(), 3);
		assert_eq!(model.calls.get(), 4);
	}

	#[test]
	fn test_guidance_blend() {
		let model = LinearModel::new();
		let cond = Array3::<f32>::ones((1, 2, 2));
		let uc = Array3::<f32>::zeros((1, 2, 2));
		let sampler = DiffusionSampler::new(SamplerKind::Ddim, &model, DDIMScheduler::new(model.schedule(), None));

		let x = Array4::<f32>::zeros((1, 1, 1, 1));
		let mut options = SampleOptions::new(1, cond.view(), [1, 1, 1]);
		options.unconditional_conditioning = Some(uc.view());
		options.guidance_scale = 3.0;
		// e_u = 0, e_c = 1 => 0 + 3 * (1 - 0)
		let eps = sampler.predict_noise(&x, 1, &options).unwrap();
		assert!((eps[[0, 0, 0, 0]] - 3.0).abs() < 1e-6);
	}

	#[test]
	fn test_fixed_noise_is_reused() {
		let model = LinearModel::new();
		let cond = Array3::<f32>::ones((2, 2, 2));
		let x_t = Array4::<f32>::random_using((2, 4, 2, 2), StandardNormal, &mut StdRng::seed_from_u64(42));
		let sampler = SamplerKind::Ddim.build(&model).unwrap();

		let mut options = SampleOptions::new(3, cond.view(), [4, 2, 2]);
		options.x_t = Some(x_t.view());
		// the run RNG differs, but with eta = 0 and fixed noise the result must not
		let (a, _) = sampler.sample(&options, &mut StdRng::seed_from_u64(1), &mut ()).unwrap();
		let (b, _) = sampler.sample(&options, &mut StdRng::seed_from_u64(2), &mut ()).unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn test_reject_mismatched_noise() {
		let model = LinearModel::new();
		let cond = Array3::<f32>::ones((2, 2, 2));
		let x_t = Array4::<f32>::zeros((1, 4, 2, 2));
		let sampler = SamplerKind::Plms.build(&model).unwrap();
		let mut options = SampleOptions::new(3, cond.view(), [4, 2, 2]);
		options.x_t = Some(x_t.view());
		assert!(sampler.sample(&options, &mut StdRng::seed_from_u64(0), &mut ()).is_err());
	}

	#[test]
	fn test_intermediates_logged() {
		let model = LinearModel::new();
		let cond = Array3::<f32>::ones((1, 2, 2));
		let sampler = SamplerKind::Ddim.build(&model).unwrap();
		let mut options = SampleOptions::new(10, cond.view(), [1, 2, 2]);
		options.log_every_t = 4;
		let (_, intermediates) = sampler.sample(&options, &mut StdRng::seed_from_u64(0), &mut ()).unwrap();
		// initial noise, steps 0, 4, 8 and the final step 9
		assert_eq!(intermediates.x_inter.len(), 5);
		assert_eq!(intermediates.pred_x0.len(), 5);
	}
}
