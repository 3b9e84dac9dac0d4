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

//! Latent diffusion models: text conditioning, noise prediction, and decoding latents back to pixels.

use std::{
	collections::BTreeSet,
	fs,
	path::{Path, PathBuf},
	sync::Arc
};

use anyhow::Context;
use ndarray::{concatenate, Array1, Array3, Array4, ArrayView3, ArrayView4, Axis, IxDyn};
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor},
	Environment, GraphOptimizationLevel, Session, SessionBuilder
};
use tracing::{debug, info, warn};

use crate::{
	clip::CLIPStandardTokenizer,
	config::{CheckpointMetadata, ComponentsConfig, ModelConfig, TokenizerConfig},
	options::Precision,
	BetaSchedule, DiffusionDevice, NoiseSchedule
};

/// A pretrained latent diffusion model.
///
/// Latents are `[batch, channels, height / f, width / f]`; decoded images are `[batch, 3, height, width]` in the model's
/// native `[-1, 1]` range.
pub trait LatentDiffusion {
	/// Encodes prompts into the conditioning the denoising network is trained on, `[batch, tokens, hidden]`.
	fn learned_conditioning(&self, prompts: &[String]) -> anyhow::Result<Array3<f32>>;

	/// Predicts the noise in `x` at training timestep `timestep`, conditioned on `conditioning`.
	fn apply_model(&self, x: ArrayView4<'_, f32>, timestep: usize, conditioning: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>>;

	/// Decodes latents into images.
	fn decode_first_stage(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>>;

	/// The noise schedule the model was trained with.
	fn schedule(&self) -> &NoiseSchedule;
}

/// Options controlling how an [`OnnxLatentDiffusion`] is loaded.
#[derive(Debug, Clone, Default)]
pub struct ModelLoadOptions {
	/// Device to place all sessions on.
	pub device: DiffusionDevice,
	/// Under [`Precision::Autocast`], half-precision component variants are used where the config declares them.
	pub precision: Precision,
	/// Report checkpoint/architecture mismatches as warnings instead of debug messages.
	pub verbose: bool,
	/// Latent channels the caller will sample with; `None` skips the check against the model config.
	pub latent_channels: Option<usize>
}

/// The result of comparing the components a model config expects against the graphs a checkpoint directory holds.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckpointReport {
	/// Files the config references that the checkpoint doesn't contain.
	pub missing: Vec<String>,
	/// ONNX graphs in the checkpoint that the config doesn't reference.
	pub unexpected: Vec<String>
}

impl CheckpointReport {
	/// Compares `components` with the `*.onnx` files in `ckpt`.
	pub fn compare(components: &ComponentsConfig, ckpt: &Path) -> anyhow::Result<Self> {
		let present = fs::read_dir(ckpt)
			.with_context(|| format!("failed to read checkpoint directory {}", ckpt.display()))?
			.filter_map(Result::ok)
			.filter(|entry| entry.path().extension().map_or(false, |ext| ext == "onnx"))
			.map(|entry| entry.file_name().to_string_lossy().into_owned())
			.collect::<BTreeSet<_>>();
		let referenced = components.referenced_files().into_iter().map(str::to_string).collect::<BTreeSet<_>>();

		Ok(Self {
			missing: referenced.difference(&present).cloned().collect(),
			unexpected: present.difference(&referenced).cloned().collect()
		})
	}

	pub fn is_clean(&self) -> bool {
		self.missing.is_empty() && self.unexpected.is_empty()
	}
}

fn create_session(environment: &Arc<Environment>, device: &DiffusionDevice, path: &Path) -> anyhow::Result<Session> {
	let session = SessionBuilder::new(environment)?
		.with_optimization_level(GraphOptimizationLevel::Level3)?
		.with_execution_providers([device.clone().into()])?
		.with_model_from_file(path)
		.with_context(|| format!("failed to load {}", path.display()))?;
	Ok(session)
}

fn select_component<'c>(full: &'c str, half: Option<&'c String>, precision: Precision) -> &'c str {
	match (precision, half) {
		(Precision::Autocast, Some(half)) => half.as_str(),
		_ => full
	}
}

/// A latent diffusion model made of three ONNX graphs: a text encoder, a denoising UNet and a VAE decoder.
pub struct OnnxLatentDiffusion {
	tokenizer: CLIPStandardTokenizer,
	text_encoder: Session,
	unet: Session,
	vae_decoder: Session,
	schedule: NoiseSchedule,
	scale_factor: f32
}

impl OnnxLatentDiffusion {
	/// Loads the model described by the config at `config_path` from the checkpoint directory `ckpt`.
	///
	/// Mismatches between the components the config expects and the graphs in the checkpoint are only logged; a
	/// required component that is actually missing fails when its session is created.
	pub fn load(environment: &Arc<Environment>, config_path: impl AsRef<Path>, ckpt: impl AsRef<Path>, options: &ModelLoadOptions) -> anyhow::Result<Self> {
		let ckpt = ckpt.as_ref();
		info!("Loading model from {}", ckpt.display());
		let config = ModelConfig::from_file(config_path)?.model;
		debug!(channels = config.channels, parameterization = ?config.parameterization, "parsed model config");
		if let Some(latent_channels) = options.latent_channels {
			config.check_latent_channels(latent_channels)?;
		}

		let metadata_path = ckpt.join("checkpoint.toml");
		if metadata_path.exists() {
			let metadata: CheckpointMetadata = toml::from_str(&fs::read_to_string(&metadata_path)?)?;
			if let Some(global_step) = metadata.global_step {
				info!("Global Step: {global_step}");
			}
		}

		let report = CheckpointReport::compare(&config.components, ckpt)?;
		if !report.missing.is_empty() {
			if options.verbose {
				warn!("missing keys: {:?}", report.missing);
			} else {
				debug!("missing keys: {:?}", report.missing);
			}
		}
		if !report.unexpected.is_empty() {
			if options.verbose {
				warn!("unexpected keys: {:?}", report.unexpected);
			} else {
				debug!("unexpected keys: {:?}", report.unexpected);
			}
		}

		let tokenizer = match &config.tokenizer {
			TokenizerConfig::CLIPTokenizer {
				path,
				model_max_length,
				bos_token,
				eos_token
			} => CLIPStandardTokenizer::new(ckpt.join(path), *model_max_length, *bos_token, *eos_token)?,
			TokenizerConfig::BERTTokenizer {
				path,
				model_max_length,
				cls_token,
				sep_token,
				pad_token
			} => {
				let path = ckpt.join(path);
				let bytes = fs::read(&path).with_context(|| format!("failed to read tokenizer {}", path.display()))?;
				CLIPStandardTokenizer::with_pad_token(bytes, *model_max_length, *cls_token, *sep_token, *pad_token)?
			}
		};

		let components = &config.components;
		let precision = options.precision;
		let text_encoder_path: PathBuf = ckpt.join(select_component(&components.text_encoder, components.text_encoder_fp16.as_ref(), precision));
		let unet_path: PathBuf = ckpt.join(select_component(&components.unet, components.unet_fp16.as_ref(), precision));
		let vae_decoder_path: PathBuf = ckpt.join(select_component(&components.vae_decoder, components.vae_decoder_fp16.as_ref(), precision));

		debug!(device = %options.device.name(), ?precision, "creating sessions");
		let text_encoder = create_session(environment, &options.device, &text_encoder_path)?;
		let unet = create_session(environment, &options.device, &unet_path)?;
		let vae_decoder = create_session(environment, &options.device, &vae_decoder_path)?;

		let schedule = NoiseSchedule::new(config.num_timesteps, config.linear_start, config.linear_end, &BetaSchedule::ScaledLinear)?;

		Ok(Self {
			tokenizer,
			text_encoder,
			unet,
			vae_decoder,
			schedule,
			scale_factor: config.scale_factor
		})
	}
}

impl LatentDiffusion for OnnxLatentDiffusion {
	fn learned_conditioning(&self, prompts: &[String]) -> anyhow::Result<Array3<f32>> {
		let text_input = self.tokenizer.encode_for_text_model(prompts)?;
		let outputs = self.text_encoder.run(vec![InputTensor::from_array(text_input.into_dyn())])?;
		let embeddings: OrtOwnedTensor<'_, f32, IxDyn> = outputs[0].try_extract()?;
		Ok(embeddings.view().to_owned().into_dimensionality()?)
	}

	fn apply_model(&self, x: ArrayView4<'_, f32>, timestep: usize, conditioning: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let timestep = Array1::from_iter([timestep as f32]).into_dyn();
		let noise_pred = self.unet.run(vec![
			InputTensor::from_array(x.to_owned().into_dyn()),
			InputTensor::from_array(timestep),
			InputTensor::from_array(conditioning.to_owned().into_dyn()),
		])?;
		let noise_pred: OrtOwnedTensor<'_, f32, IxDyn> = noise_pred[0].try_extract()?;
		Ok(noise_pred.view().to_owned().into_dimensionality()?)
	}

	fn decode_first_stage(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let latents = (1.0 / self.scale_factor) * &latents;

		let mut images = Vec::with_capacity(latents.shape()[0]);
		for latent_chunk in latents.axis_iter(Axis(0)) {
			let latent_chunk = latent_chunk.insert_axis(Axis(0)).to_owned().into_dyn();
			let image = self.vae_decoder.run(vec![InputTensor::from_array(latent_chunk)])?;
			let image: OrtOwnedTensor<'_, f32, IxDyn> = image[0].try_extract()?;
			let image: Array4<f32> = image.view().to_owned().into_dimensionality()?;
			images.push(image);
		}

		let views = images.iter().map(|i| i.view()).collect::<Vec<_>>();
		Ok(concatenate(Axis(0), &views)?)
	}

	fn schedule(&self) -> &NoiseSchedule {
		&self.schedule
	}
}
