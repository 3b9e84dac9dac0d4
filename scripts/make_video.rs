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

//! Turns the per-step preview frames written by `txt2img` into videos.

use std::path::PathBuf;

use clap::Parser;
use ldm_txt2img::video::write_video;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Stitch PNG frames into an uncompressed AVI at 5 fps. Without arguments, writes `video1.avi` from
/// `outputs/txt2img-samples/process` and `video2.avi` from `outputs/txt2img-samples/process2`.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Directory of `*.png` frames.
	image_folder: Option<PathBuf>,
	/// Output file.
	#[arg(default_value = "video.avi")]
	video_name: PathBuf
}

fn main() -> anyhow::Result<()> {
	let filter = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let args = Args::parse();
	match args.image_folder {
		Some(folder) => {
			write_video(&args.video_name, folder)?;
		}
		None => {
			write_video("video1.avi", "outputs/txt2img-samples/process")?;
			write_video("video2.avi", "outputs/txt2img-samples/process2")?;
		}
	}
	Ok(())
}
