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

use std::path::PathBuf;

use image::RgbImage;
use kdam::{tqdm, BarExt};
use ndarray::{s, Array4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info};

use super::{
	batch_prompts,
	postprocess::{make_grid, to_images, to_unit_range, FileCounter, OutputDirs},
	safety::{apply_safety, SafetyChecker},
	Prompt
};
use crate::{watermark::WatermarkEncoder, LatentDiffusion, RunConfig, SampleOptions, StepTrace};

/// Draws the starting code shared by every batch in fixed-code mode.
pub fn initial_noise(rng: &mut StdRng, shape: [usize; 4]) -> Array4<f32> {
	Array4::random_using((shape[0], shape[1], shape[2], shape[3]), StandardNormal, rng)
}

/// What a finished run wrote.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
	pub outdir: PathBuf,
	/// Individual samples, in the order they were saved.
	pub samples: Vec<PathBuf>,
	pub grid: Option<PathBuf>,
	/// Frames written to `process/`.
	pub process_frames: usize,
	/// Frames written to `process2/`.
	pub process2_frames: usize,
	/// Samples replaced by the safety filter.
	pub flagged: usize
}

/// One text-to-image run: `n_iter` passes over every prompt batch.
///
/// ```ignore
/// let summary = Txt2ImgRun::new(&config, &model, &safety)?.run()?;
/// println!("{} samples in {}", summary.samples.len(), summary.outdir.display());
/// ```
pub struct Txt2ImgRun<'a, M: LatentDiffusion + ?Sized, C: SafetyChecker + ?Sized> {
	config: &'a RunConfig,
	model: &'a M,
	safety: &'a C,
	watermark: Option<WatermarkEncoder>
}

impl<'a, M: LatentDiffusion + ?Sized, C: SafetyChecker + ?Sized> Txt2ImgRun<'a, M, C> {
	pub fn new(config: &'a RunConfig, model: &'a M, safety: &'a C) -> anyhow::Result<Self> {
		let watermark = if config.watermark {
			info!("Creating invisible watermark encoder (see https://github.com/ShieldMnt/invisible-watermark)...");
			Some(WatermarkEncoder::default())
		} else {
			None
		};
		Ok(Self { config, model, safety, watermark })
	}

	fn put_watermark(&self, image: RgbImage) -> anyhow::Result<RgbImage> {
		match &self.watermark {
			Some(encoder) => encoder.encode(&image),
			None => Ok(image)
		}
	}

	/// Decodes every recorded step and saves its images; returns the number of frames written.
	fn flush_steps(&self, steps: &[Array4<f32>], counter: &mut FileCounter) -> anyhow::Result<usize> {
		let mut written = 0;
		for latents in steps {
			let decoded = self.model.decode_first_stage(latents.view())?;
			for image in to_images(to_unit_range(decoded.view()).view())? {
				counter.save(&image)?;
				written += 1;
			}
		}
		Ok(written)
	}

	pub fn run(&self) -> anyhow::Result<RunSummary> {
		let config = self.config;
		let dirs = OutputDirs::create(&config.outdir)?;
		let batches = batch_prompts(&config.prompt, config.batch_size)?;
		let sampler = config.sampler.build(self.model)?;
		info!("Sampling with {} ({} steps)", sampler.kind(), config.steps);

		let mut rng = StdRng::seed_from_u64(config.seed);
		let shape = config.latent_shape();
		let start_code = if config.fixed_code {
			Some(initial_noise(&mut rng, [config.batch_size, shape[0], shape[1], shape[2]]))
		} else {
			None
		};

		let mut sample_counter = FileCounter::for_dir(&dirs.samples)?;
		let mut process_counter = FileCounter::for_dir(&dirs.process)?;
		let mut process2_counter = FileCounter::for_dir(&dirs.process2)?;
		let mut grid_counter = FileCounter::for_grids(&dirs.root)?;

		let mut summary = RunSummary {
			outdir: dirs.root.clone(),
			..Default::default()
		};
		let mut grid_images = Vec::new();

		let mut iter_pb = tqdm!(total = config.n_iter, desc = "Sampling");
		for _ in 0..config.n_iter {
			let mut data_pb = tqdm!(total = batches.len(), desc = "data");
			for prompts in &batches {
				let active = prompts.len();
				let unconditional = if config.guidance_scale != 1.0 {
					Some(self.model.learned_conditioning(&Prompt::unconditional(active))?)
				} else {
					None
				};
				let conditioning = self.model.learned_conditioning(prompts)?;
				debug!("conditioning shape {:?}", conditioning.shape());

				let mut options = SampleOptions::new(config.steps, conditioning.view(), shape);
				options.guidance_scale = config.guidance_scale;
				options.unconditional_conditioning = unconditional.as_ref().map(|uc| uc.view());
				options.eta = config.eta;
				options.x_t = start_code.as_ref().map(|x| x.slice(s![..active, .., .., ..]));

				let mut trace = StepTrace::new();
				let (latents, _) = sampler.sample(&options, &mut rng, &mut trace)?;
				summary.process2_frames += self.flush_steps(&trace.denoised, &mut process2_counter)?;
				summary.process_frames += self.flush_steps(&trace.trajectory, &mut process_counter)?;
				drop(trace);

				anyhow::ensure!(latents.shape()[0] == active, "sampled {} latents for a batch of {active}", latents.shape()[0]);
				let decoded = self.model.decode_first_stage(latents.view())?;
				anyhow::ensure!(decoded.shape()[0] == active, "decoded {} images for a batch of {active}", decoded.shape()[0]);

				let mut images = to_unit_range(decoded.view());
				let flagged = self.safety.check(images.view())?;
				summary.flagged += apply_safety(images.view_mut(), &flagged, &config.placeholder)?;
				let images = to_images(images.view())?;

				if !config.skip_save {
					for image in &images {
						let image = self.put_watermark(image.clone())?;
						summary.samples.push(sample_counter.save(&image)?);
					}
				}
				if !config.skip_grid {
					grid_images.extend(images);
				}
				data_pb.update(1);
			}
			iter_pb.update(1);
		}

		if !config.skip_grid {
			let grid = self.put_watermark(make_grid(&grid_images, config.n_rows)?)?;
			summary.grid = Some(grid_counter.save(&grid)?);
		}

		info!("Your samples are ready and waiting for you here: {}", dirs.root.display());
		Ok(summary)
	}
}
