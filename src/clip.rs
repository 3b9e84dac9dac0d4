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

//! Prompt tokenizer for the conditioning text encoder.

use std::path::Path;

use ndarray::Array2;
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

/// A [CLIP](https://arxiv.org/abs/2103.00020)-style tokenizer that always emits `model_max_length` tokens per prompt,
/// truncating long prompts and padding short ones with the end-of-string token.
pub struct CLIPStandardTokenizer {
	inner: Tokenizer,
	model_max_length: usize,
	bos_token_id: u32,
	eos_token_id: u32
}

impl CLIPStandardTokenizer {
	/// Loads a tokenizer from a HuggingFace `tokenizer.json` file.
	pub fn new(path: impl AsRef<Path>, model_max_length: usize, bos_token_id: u32, eos_token_id: u32) -> anyhow::Result<Self> {
		let bytes = std::fs::read(path)?;
		Self::from_bytes(bytes, model_max_length, bos_token_id, eos_token_id)
	}

	/// Loads a tokenizer from the bytes of a `tokenizer.json` file.
	pub fn from_bytes<B: AsRef<[u8]>>(bytes: B, model_max_length: usize, bos_token_id: u32, eos_token_id: u32) -> anyhow::Result<Self> {
		Self::with_pad_token(bytes, model_max_length, bos_token_id, eos_token_id, eos_token_id)
	}

	/// Like [`CLIPStandardTokenizer::from_bytes`], but pads with `pad_token_id` instead of the end-of-string token, as
	/// BERT-style vocabularies do.
	pub fn with_pad_token<B: AsRef<[u8]>>(bytes: B, model_max_length: usize, bos_token_id: u32, eos_token_id: u32, pad_token_id: u32) -> anyhow::Result<Self> {
		let mut inner: Tokenizer = serde_json::from_slice(bytes.as_ref())?;
		let pad_token = inner.id_to_token(pad_token_id).unwrap_or_else(|| "<|endoftext|>".to_string());
		inner.with_padding(Some(PaddingParams {
			strategy: PaddingStrategy::Fixed(model_max_length),
			direction: PaddingDirection::Right,
			pad_id: pad_token_id,
			pad_token,
			..Default::default()
		}));
		inner.with_truncation(Some(TruncationParams {
			max_length: model_max_length,
			..Default::default()
		}));
		Ok(Self {
			inner,
			model_max_length,
			bos_token_id,
			eos_token_id
		})
	}

	/// Returns the number of tokens each encoded prompt occupies. For most CLIP models, this is 77 tokens.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.model_max_length
	}

	/// Returns the ID of the end-of-string token.
	pub fn eos(&self) -> u32 {
		self.eos_token_id
	}

	/// Returns the ID of the beginning-of-string token.
	pub fn bos(&self) -> u32 {
		self.bos_token_id
	}

	/// Encodes the prompts into an `[batch, len]` array of token IDs to be passed to the text encoder.
	pub fn encode_for_text_model<S: AsRef<str>>(&self, prompts: &[S]) -> anyhow::Result<Array2<i32>> {
		let inputs = prompts.iter().map(|p| p.as_ref().to_string()).collect::<Vec<_>>();
		let encodings = self.inner.encode_batch(inputs, true).map_err(|e| anyhow::anyhow!("{e:?}"))?;
		let ids = encodings
			.iter()
			.flat_map(|enc| enc.get_ids().iter().map(|tok| *tok as i32).collect::<Vec<i32>>())
			.collect::<Vec<_>>();
		Ok(Array2::from_shape_vec((prompts.len(), self.len()), ids)?)
	}
}
