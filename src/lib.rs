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

//! `ldm-txt2img` drives text-to-image sampling for pretrained latent diffusion checkpoints exported to [ONNX Runtime].
//!
//! A run loads a model described by a TOML model config, samples latents for batches of prompts with one of three
//! samplers (DDIM, PLMS or DPM-Solver++), decodes them, runs a safety classifier over the decoded images, embeds an
//! invisible watermark and writes everything into an output directory:
//!
//! ```text
//! <outdir>/samples/NNNNN.png    individual samples
//! <outdir>/process/NNNNN.png    per-step sampler trajectory
//! <outdir>/process2/NNNNN.png   per-step predicted x_0
//! <outdir>/grid-NNNN.png        composite grid of the whole run
//! ```
//!
//! The library side is usable without the `txt2img` binary:
//! ```ignore
//! use ldm_txt2img::{OnnxLatentDiffusion, OnnxSafetyChecker, RunConfig, Txt2ImgRun};
//!
//! let config: RunConfig = /* ... */;
//! let model = OnnxLatentDiffusion::load(&environment, &config.config, &config.ckpt, &config.model_options())?;
//! let safety = OnnxSafetyChecker::load(&environment, &config.safety_model, config.device.clone())?;
//! let summary = Txt2ImgRun::new(&config, &model, &safety)?.run()?;
//! ```
//!
//! [ONNX Runtime]: https://onnxruntime.ai/

#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub mod clip;
pub mod config;
pub mod model;
pub mod options;
pub mod pipelines;
pub mod sampler;
pub mod schedulers;
pub mod video;
pub mod watermark;

pub use ort::Environment as OrtEnvironment;
use ort::ExecutionProvider;

pub use self::model::{CheckpointReport, LatentDiffusion, ModelLoadOptions, OnnxLatentDiffusion};
pub use self::options::{Precision, PromptSource, RunConfig, Txt2ImgArgs};
pub use self::pipelines::*;
pub use self::sampler::{SampleIntermediates, SampleOptions, Sampler, SamplerKind, StepAccumulator, StepTrace};
pub use self::schedulers::*;

/// A device on which to place the diffusion model and the safety classifier.
///
/// If a configured execution provider is not available at runtime, ONNX Runtime places the session on the CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Use the CPU as a device.
	CPU,
	/// Use NVIDIA CUDA as a device, with the given device ID (which can be set to 0 in most cases).
	CUDA(usize),
	/// Use NVIDIA TensorRT as a device. Requires an NVIDIA Kepler GPU or later.
	TensorRT
}

impl Default for DiffusionDevice {
	fn default() -> Self {
		Self::CPU
	}
}

impl DiffusionDevice {
	/// Picks the best accelerator ONNX Runtime reports as available, falling back to the CPU.
	pub fn best_available() -> Self {
		if ExecutionProvider::cuda().is_available() {
			Self::CUDA(0)
		} else {
			Self::CPU
		}
	}

	/// Short, human-readable name used in logs.
	pub fn name(&self) -> String {
		match self {
			Self::CPU => "cpu".to_string(),
			Self::CUDA(device) => format!("cuda:{device}"),
			Self::TensorRT => "tensorrt".to_string()
		}
	}
}

impl From<DiffusionDevice> for ExecutionProvider {
	fn from(value: DiffusionDevice) -> Self {
		match value {
			DiffusionDevice::CPU => ExecutionProvider::cpu(),
			DiffusionDevice::CUDA(device) => ExecutionProvider::cuda().with("device_id", device.to_string()),
			DiffusionDevice::TensorRT => ExecutionProvider::tensorrt()
		}
	}
}
