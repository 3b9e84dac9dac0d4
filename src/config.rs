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

//! Model configuration files.
//!
//! A model config describes the architecture a checkpoint directory is expected to contain:
//! ```toml
//! [model]
//! num-timesteps = 1000
//! linear-start = 0.00085
//! linear-end = 0.012
//! scale-factor = 0.18215
//! channels = 4
//!
//! [model.tokenizer]
//! type = "CLIPTokenizer"
//! path = "tokenizer.json"
//! model-max-length = 77
//! bos-token = 49406
//! eos-token = 49407
//!
//! [model.components]
//! text-encoder = "text_encoder.onnx"
//! unet = "unet.onnx"
//! unet-fp16 = "unet.fp16.onnx"
//! vae-decoder = "vae_decoder.onnx"
//! ```

use std::{fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// What the denoising network predicts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Parameterization {
	/// The network predicts the noise added to the sample.
	#[default]
	Eps
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
#[non_exhaustive]
pub enum TokenizerConfig {
	#[serde(rename_all = "kebab-case")]
	CLIPTokenizer {
		path: String,
		model_max_length: usize,
		bos_token: u32,
		eos_token: u32
	},
	/// WordPiece vocabulary of the BERT text encoder used by the LAION-400M model.
	#[serde(rename_all = "kebab-case")]
	BERTTokenizer {
		path: String,
		model_max_length: usize,
		cls_token: u32,
		sep_token: u32,
		pad_token: u32
	}
}

/// ONNX graph file names inside a checkpoint directory. `*-fp16` entries are optional mixed-precision variants (float16
/// weights with float32 inputs and outputs) used under autocast precision.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ComponentsConfig {
	pub text_encoder: String,
	pub text_encoder_fp16: Option<String>,
	pub unet: String,
	pub unet_fp16: Option<String>,
	pub vae_decoder: String,
	pub vae_decoder_fp16: Option<String>
}

impl ComponentsConfig {
	/// Every file name the config references, full and half precision alike.
	pub fn referenced_files(&self) -> Vec<&str> {
		let mut files = vec![self.text_encoder.as_str(), self.unet.as_str(), self.vae_decoder.as_str()];
		files.extend([&self.text_encoder_fp16, &self.unet_fp16, &self.vae_decoder_fp16].into_iter().flatten().map(String::as_str));
		files
	}
}

fn default_scale_factor() -> f32 {
	0.18215
}

fn default_channels() -> usize {
	4
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LatentDiffusionConfig {
	pub num_timesteps: usize,
	pub linear_start: f32,
	pub linear_end: f32,
	#[serde(default = "default_scale_factor")]
	pub scale_factor: f32,
	#[serde(default = "default_channels")]
	pub channels: usize,
	#[serde(default)]
	pub parameterization: Parameterization,
	pub tokenizer: TokenizerConfig,
	pub components: ComponentsConfig
}

impl LatentDiffusionConfig {
	/// Errors if latents of `latent_channels` channels can't be fed to this model.
	pub fn check_latent_channels(&self, latent_channels: usize) -> anyhow::Result<()> {
		anyhow::ensure!(
			latent_channels == self.channels,
			"requested {latent_channels} latent channels, but the model config declares {} (`--C`)",
			self.channels
		);
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModelConfig {
	pub model: LatentDiffusionConfig
}

impl ModelConfig {
	pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
		let path = path.as_ref();
		let text = fs::read_to_string(path).with_context(|| format!("failed to read model config {}", path.display()))?;
		Self::from_str(&text).with_context(|| format!("malformed model config {}", path.display()))
	}

	#[allow(clippy::should_implement_trait)]
	pub fn from_str(text: &str) -> anyhow::Result<Self> {
		let config: ModelConfig = toml::from_str(text)?;
		let model = &config.model;
		if model.num_timesteps == 0 {
			anyhow::bail!("num-timesteps ({}) must be >0", model.num_timesteps);
		}
		if !model.linear_start.is_normal() || !model.linear_end.is_normal() || model.linear_start >= model.linear_end {
			anyhow::bail!("linear-start ({}) must be < linear-end ({}) and both must be normal", model.linear_start, model.linear_end);
		}
		Ok(config)
	}
}

/// Optional metadata stored next to the ONNX graphs in a checkpoint directory.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckpointMetadata {
	pub global_step: Option<u64>
}

/// The `preprocessor_config.json` of a CLIP feature extractor, as written by HuggingFace transformers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CLIPFeatureExtractorConfig {
	#[serde(default = "default_clip_size")]
	pub size: u32,
	#[serde(default = "default_clip_size")]
	pub crop_size: u32,
	#[serde(default = "default_true")]
	pub do_resize: bool,
	#[serde(default = "default_true")]
	pub do_center_crop: bool,
	#[serde(default = "default_true")]
	pub do_normalize: bool,
	pub image_mean: Vec<f32>,
	pub image_std: Vec<f32>
}

fn default_clip_size() -> u32 {
	224
}

fn default_true() -> bool {
	true
}
