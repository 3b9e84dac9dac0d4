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

//! Samples images for a prompt (or a file of prompts) and writes them to the output directory.

use std::sync::Arc;

use clap::Parser;
use ldm_txt2img::{OnnxLatentDiffusion, OnnxSafetyChecker, OrtEnvironment, Txt2ImgArgs, Txt2ImgRun};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn main() -> anyhow::Result<()> {
	let filter = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let config = Txt2ImgArgs::parse().into_run_config()?;
	if let ldm_txt2img::PromptSource::File(path) = &config.prompt {
		info!("reading prompts from {}", path.display());
	}

	let environment = Arc::new(OrtEnvironment::builder().with_name("ldm-txt2img").build()?);
	let model = OnnxLatentDiffusion::load(&environment, &config.config, &config.ckpt, &config.model_options())?;
	let safety = OnnxSafetyChecker::load(&environment, &config.safety_model, config.device.clone())?;

	let summary = Txt2ImgRun::new(&config, &model, &safety)?.run()?;
	info!(
		samples = summary.samples.len(),
		grid = ?summary.grid,
		flagged = summary.flagged,
		"Enjoy."
	);
	Ok(())
}
