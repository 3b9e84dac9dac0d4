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

//! The text-to-image pipeline and its pieces: prompt batching, safety filtering and output handling.

use std::{fs, ops::Deref, path::Path};

use anyhow::Context;

use crate::PromptSource;

pub mod postprocess;
pub mod safety;
mod txt2img;

pub use self::postprocess::{make_grid, to_images, FileCounter, OutputDirs};
pub use self::safety::{apply_safety, load_replacement, OnnxSafetyChecker, SafetyChecker};
pub use self::txt2img::{initial_noise, RunSummary, Txt2ImgRun};

/// One batch of text prompts, in sampling order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Prompt(pub(crate) Vec<String>);

impl Deref for Prompt {
	type Target = Vec<String>;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Prompt {
	/// `batch_size` copies of a single prompt.
	pub fn repeated(prompt: impl Into<String>, batch_size: usize) -> Self {
		Self(vec![prompt.into(); batch_size])
	}

	/// A batch of empty prompts, used as the unconditional input for classifier-free guidance.
	pub fn unconditional(batch_size: usize) -> Self {
		Self::repeated("", batch_size)
	}
}

impl<'s> From<&'s str> for Prompt {
	fn from(value: &'s str) -> Self {
		Self(vec![value.to_string()])
	}
}

impl From<String> for Prompt {
	fn from(value: String) -> Self {
		Self(vec![value])
	}
}

impl<'s> From<&'s [String]> for Prompt {
	fn from(value: &'s [String]) -> Self {
		Self(value.to_vec())
	}
}

impl<'s> From<Vec<&'s str>> for Prompt {
	fn from(value: Vec<&'s str>) -> Self {
		Self(value.iter().map(|v| v.to_string()).collect())
	}
}

impl From<Vec<String>> for Prompt {
	fn from(value: Vec<String>) -> Self {
		Self(value)
	}
}

/// Reads a prompt file, one prompt per line.
pub fn read_prompt_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
	let path = path.as_ref();
	let text = fs::read_to_string(path).with_context(|| format!("failed to read prompt file {}", path.display()))?;
	let prompts: Vec<String> = text.lines().map(str::to_string).collect();
	if prompts.is_empty() {
		anyhow::bail!("prompt file {} contains no prompts", path.display());
	}
	Ok(prompts)
}

/// Splits the prompt source into batches of `batch_size`. A literal prompt is repeated to fill exactly one batch; prompts
/// from a file are chunked in order, so the last batch may be shorter.
pub fn batch_prompts(source: &PromptSource, batch_size: usize) -> anyhow::Result<Vec<Prompt>> {
	anyhow::ensure!(batch_size > 0, "batch size must be >0");
	match source {
		PromptSource::Literal(prompt) => Ok(vec![Prompt::repeated(prompt.as_str(), batch_size)]),
		PromptSource::File(path) => {
			let prompts = read_prompt_file(path)?;
			Ok(prompts.chunks(batch_size).map(Prompt::from).collect())
		}
	}
}
