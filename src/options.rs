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

//! Command line options and the run configuration they resolve into.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;

use crate::{model::ModelLoadOptions, DiffusionDevice, SamplerKind};

/// Numeric precision to evaluate the model at.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Precision {
	/// Float32 everywhere.
	Full,
	/// Mixed precision: half-precision graphs where the model config provides them.
	#[default]
	Autocast
}

/// Where to place the model.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceChoice {
	/// The best accelerator ONNX Runtime reports as available, else the CPU.
	#[default]
	Auto,
	Cpu,
	Cuda,
	Tensorrt
}

impl From<DeviceChoice> for DiffusionDevice {
	fn from(value: DeviceChoice) -> Self {
		match value {
			DeviceChoice::Auto => DiffusionDevice::best_available(),
			DeviceChoice::Cpu => DiffusionDevice::CPU,
			DeviceChoice::Cuda => DiffusionDevice::CUDA(0),
			DeviceChoice::Tensorrt => DiffusionDevice::TensorRT
		}
	}
}

pub const LAION400M_CONFIG: &str = "configs/latent-diffusion/txt2img-1p4B-eval.toml";
pub const LAION400M_CKPT: &str = "models/ldm/text2img-large";
pub const LAION400M_OUTDIR: &str = "outputs/txt2img-samples-laion400m";

/// Sample images from a latent diffusion model.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Txt2ImgArgs {
	/// The prompt to render.
	#[arg(long, default_value = "a painting of a virus monster playing guitar")]
	pub prompt: String,

	/// Directory to write results to.
	#[arg(long, default_value = "outputs/txt2img-samples")]
	pub outdir: PathBuf,

	/// Do not save a grid, only individual samples. Helpful when evaluating lots of samples.
	#[arg(long = "skip_grid")]
	pub skip_grid: bool,

	/// Do not save individual samples. For speed measurements.
	#[arg(long = "skip_save")]
	pub skip_save: bool,

	/// Number of sampling steps.
	#[arg(long = "ddim_steps", default_value_t = 50)]
	pub ddim_steps: usize,

	/// Use PLMS sampling.
	#[arg(long)]
	pub plms: bool,

	/// Use DPM-Solver sampling. Takes priority over `--plms`.
	#[arg(long = "dpm_solver")]
	pub dpm_solver: bool,

	/// Sampler to use when neither `--plms` nor `--dpm_solver` is given.
	#[arg(long, value_enum, default_value_t = SamplerKind::Ddim)]
	pub sampler: SamplerKind,

	/// Use the LAION-400M model: overrides `--config`, `--ckpt` and `--outdir`.
	#[arg(long)]
	pub laion400m: bool,

	/// Use the same starting code for every batch.
	#[arg(long = "fixed_code")]
	pub fixed_code: bool,

	/// DDIM eta (eta = 0.0 corresponds to deterministic sampling).
	#[arg(long = "ddim_eta", default_value_t = 0.0)]
	pub ddim_eta: f32,

	/// Sample this often.
	#[arg(long = "n_iter", default_value_t = 2)]
	pub n_iter: usize,

	/// Image height, in pixel space.
	#[arg(long = "H", default_value_t = 512)]
	pub height: usize,

	/// Image width, in pixel space.
	#[arg(long = "W", default_value_t = 512)]
	pub width: usize,

	/// Latent channels.
	#[arg(long = "C", default_value_t = 4)]
	pub latent_channels: usize,

	/// Downsampling factor.
	#[arg(long = "f", default_value_t = 8)]
	pub downsampling_factor: usize,

	/// How many samples to produce for each given prompt, a.k.a. batch size.
	#[arg(long = "n_samples", default_value_t = 3)]
	pub n_samples: usize,

	/// Images per grid row (default: n_samples).
	#[arg(long = "n_rows", default_value_t = 0)]
	pub n_rows: usize,

	/// Unconditional guidance scale: eps = eps(x, empty) + scale * (eps(x, cond) - eps(x, empty)).
	#[arg(long, default_value_t = 7.5)]
	pub scale: f32,

	/// If specified, load prompts from this file, one per line.
	#[arg(long = "from-file", value_name = "FILE")]
	pub from_file: Option<PathBuf>,

	/// Path to the model config.
	#[arg(long, value_name = "FILE", default_value = "configs/stable-diffusion/v1-inference.toml")]
	pub config: PathBuf,

	/// Path to the checkpoint directory holding the model's ONNX graphs.
	#[arg(long, value_name = "DIR", default_value = "models/ldm/stable-diffusion-v1")]
	pub ckpt: PathBuf,

	/// The seed (for reproducible sampling).
	#[arg(long, default_value_t = 42)]
	pub seed: u64,

	/// Evaluate at this precision.
	#[arg(long, value_enum, default_value_t = Precision::Autocast)]
	pub precision: Precision,

	/// Directory holding the safety classifier (`safety_checker.onnx` and `preprocessor_config.json`).
	#[arg(long = "safety-model", value_name = "DIR", default_value = "models/safety-checker")]
	pub safety_model: PathBuf,

	/// Image substituted for samples flagged by the safety classifier.
	#[arg(long, value_name = "FILE", default_value = "assets/rick.jpeg")]
	pub placeholder: PathBuf,

	/// Don't embed the invisible watermark.
	#[arg(long = "no-watermark")]
	pub no_watermark: bool,

	/// Device to run the model on.
	#[arg(long, value_enum, default_value_t = DeviceChoice::Auto)]
	pub device: DeviceChoice,

	/// Report differences between the model config and the checkpoint as warnings.
	#[arg(long)]
	pub verbose: bool
}

/// Where prompts come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
	/// A single prompt, repeated to fill the batch.
	Literal(String),
	/// A file of prompts, one per line.
	File(PathBuf)
}

/// The fully resolved, immutable configuration of a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
	pub prompt: PromptSource,
	pub outdir: PathBuf,
	pub height: usize,
	pub width: usize,
	pub latent_channels: usize,
	pub downsampling_factor: usize,
	pub batch_size: usize,
	pub n_rows: usize,
	pub n_iter: usize,
	pub guidance_scale: f32,
	pub sampler: SamplerKind,
	pub steps: usize,
	pub eta: f32,
	pub seed: u64,
	pub fixed_code: bool,
	pub precision: Precision,
	pub config: PathBuf,
	pub ckpt: PathBuf,
	pub skip_grid: bool,
	pub skip_save: bool,
	pub safety_model: PathBuf,
	pub placeholder: PathBuf,
	pub watermark: bool,
	pub device: DiffusionDevice,
	pub verbose: bool
}

impl RunConfig {
	/// Latent shape without the batch dimension.
	pub fn latent_shape(&self) -> [usize; 3] {
		[self.latent_channels, self.height / self.downsampling_factor, self.width / self.downsampling_factor]
	}

	pub fn model_options(&self) -> ModelLoadOptions {
		ModelLoadOptions {
			device: self.device.clone(),
			precision: self.precision,
			verbose: self.verbose,
			latent_channels: Some(self.latent_channels)
		}
	}
}

impl Txt2ImgArgs {
	/// Resolves the sampler from the legacy boolean flags: `--dpm_solver` wins over `--plms`, which wins over
	/// `--sampler`.
	pub fn sampler_kind(&self) -> SamplerKind {
		if self.dpm_solver {
			SamplerKind::DpmSolver
		} else if self.plms {
			SamplerKind::Plms
		} else {
			self.sampler
		}
	}

	/// Applies presets, validates the options and resolves them into a [`RunConfig`]. No directories are created.
	pub fn into_run_config(mut self) -> anyhow::Result<RunConfig> {
		if self.laion400m {
			info!("Falling back to LAION 400M model...");
			self.config = PathBuf::from(LAION400M_CONFIG);
			self.ckpt = PathBuf::from(LAION400M_CKPT);
			self.outdir = PathBuf::from(LAION400M_OUTDIR);
		}

		let sampler = self.sampler_kind();
		if self.downsampling_factor == 0 {
			anyhow::bail!("downsampling factor must be >0");
		}
		if self.height % self.downsampling_factor != 0 || self.width % self.downsampling_factor != 0 {
			anyhow::bail!(
				"`W` ({}) and `H` ({}) must be divisible by the downsampling factor ({})",
				self.width,
				self.height,
				self.downsampling_factor
			);
		}
		if self.height == 0 || self.width == 0 || self.latent_channels == 0 {
			anyhow::bail!("image size and latent channels must be >0");
		}
		if self.n_samples == 0 {
			anyhow::bail!("n_samples must be >0");
		}
		if self.n_iter == 0 {
			anyhow::bail!("n_iter must be >0");
		}
		if self.ddim_steps == 0 {
			anyhow::bail!("ddim_steps must be >0");
		}
		if !(0.0..=1.0).contains(&self.ddim_eta) {
			anyhow::bail!("ddim_eta ({}) must be within [0, 1]", self.ddim_eta);
		}

		let prompt = match self.from_file {
			Some(path) => {
				if !path.is_file() {
					anyhow::bail!("prompt file {} does not exist", path.display());
				}
				PromptSource::File(path)
			}
			None => {
				if self.prompt.trim().is_empty() {
					anyhow::bail!("a prompt is required when --from-file is not given");
				}
				PromptSource::Literal(self.prompt)
			}
		};

		if !self.config.is_file() {
			anyhow::bail!("model config {} does not exist", self.config.display());
		}

		Ok(RunConfig {
			prompt,
			outdir: self.outdir,
			height: self.height,
			width: self.width,
			latent_channels: self.latent_channels,
			downsampling_factor: self.downsampling_factor,
			batch_size: self.n_samples,
			n_rows: if self.n_rows > 0 { self.n_rows } else { self.n_samples },
			n_iter: self.n_iter,
			guidance_scale: self.scale,
			sampler,
			steps: self.ddim_steps,
			eta: self.ddim_eta,
			seed: self.seed,
			fixed_code: self.fixed_code,
			precision: self.precision,
			config: self.config,
			ckpt: self.ckpt,
			skip_grid: self.skip_grid,
			skip_save: self.skip_save,
			safety_model: self.safety_model,
			placeholder: self.placeholder,
			watermark: !self.no_watermark,
			device: self.device.into(),
			verbose: self.verbose
		})
	}
}
