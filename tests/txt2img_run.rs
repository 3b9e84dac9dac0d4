use std::{
	cell::Cell,
	fs,
	path::{Path, PathBuf}
};

use image::{Rgb, RgbImage};
use ldm_txt2img::{
	watermark::{WatermarkDecoder, DEFAULT_WATERMARK},
	BetaSchedule, DiffusionDevice, LatentDiffusion, NoiseSchedule, Precision, PromptSource, RunConfig, SafetyChecker, SamplerKind, Txt2ImgRun
};
use ndarray::{Array3, Array4, ArrayView3, ArrayView4};

/// Predicts `0.1 * x`; decodes by nearest-neighbour upsampling of the first three latent channels.
struct MockModel {
	schedule: NoiseSchedule,
	factor: usize,
	/// Scales decoded values, `1.0` spans the full `[-1, 1]` range.
	contrast: f32,
	decodes: Cell<usize>
}

impl MockModel {
	fn new(factor: usize) -> Self {
		Self {
			schedule: NoiseSchedule::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear).unwrap(),
			factor,
			contrast: 1.0,
			decodes: Cell::new(0)
		}
	}

	/// Decodes into mid-tones only, so no pixel saturates.
	fn low_contrast(factor: usize) -> Self {
		Self { contrast: 0.5, ..Self::new(factor) }
	}
}

impl LatentDiffusion for MockModel {
	fn learned_conditioning(&self, prompts: &[String]) -> anyhow::Result<Array3<f32>> {
		Ok(Array3::from_shape_fn((prompts.len(), 3, 4), |(b, _, _)| prompts[b].len() as f32 / 10.0))
	}

	fn apply_model(&self, x: ArrayView4<'_, f32>, _: usize, conditioning: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
		anyhow::ensure!(x.shape()[0] == conditioning.shape()[0], "batch mismatch");
		Ok(0.1 * &x)
	}

	fn decode_first_stage(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		self.decodes.set(self.decodes.get() + 1);
		let (batch, _, height, width) = latents.dim();
		let f = self.factor;
		Ok(Array4::from_shape_fn((batch, 3, height * f, width * f), |(b, c, y, x)| self.contrast * latents[[b, c, y / f, x / f]].tanh()))
	}

	fn schedule(&self) -> &NoiseSchedule {
		&self.schedule
	}
}

/// Flags the first image of every batch when `flag_first` is set.
struct MockSafetyChecker {
	flag_first: bool,
	calls: Cell<usize>
}

impl MockSafetyChecker {
	fn new(flag_first: bool) -> Self {
		Self { flag_first, calls: Cell::new(0) }
	}
}

impl SafetyChecker for MockSafetyChecker {
	fn check(&self, images: ArrayView4<'_, f32>) -> anyhow::Result<Vec<bool>> {
		self.calls.set(self.calls.get() + 1);
		Ok((0..images.shape()[0]).map(|i| self.flag_first && i == 0).collect())
	}
}

fn run_config(outdir: &Path) -> RunConfig {
	RunConfig {
		prompt: PromptSource::Literal("a painting of a virus monster playing guitar".to_string()),
		outdir: outdir.to_path_buf(),
		height: 16,
		width: 16,
		latent_channels: 4,
		downsampling_factor: 8,
		batch_size: 2,
		n_rows: 2,
		n_iter: 1,
		guidance_scale: 7.5,
		sampler: SamplerKind::Ddim,
		steps: 3,
		eta: 0.0,
		seed: 42,
		fixed_code: false,
		precision: Precision::Full,
		config: PathBuf::from("configs/stable-diffusion/v1-inference.toml"),
		ckpt: PathBuf::from("models/ldm/stable-diffusion-v1"),
		skip_grid: false,
		skip_save: false,
		safety_model: PathBuf::from("models/safety-checker"),
		placeholder: outdir.join("missing-placeholder.jpeg"),
		watermark: false,
		device: DiffusionDevice::CPU,
		verbose: false
	}
}

fn file_names(dir: &Path) -> Vec<String> {
	let mut names = fs::read_dir(dir)
		.unwrap()
		.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
		.collect::<Vec<_>>();
	names.sort();
	names
}

#[test]
fn two_samples_one_iteration_no_grid() {
	let dir = tempfile::tempdir().unwrap();
	let mut config = run_config(dir.path());
	config.skip_grid = true;

	let model = MockModel::new(8);
	let summary = Txt2ImgRun::new(&config, &model, &MockSafetyChecker::new(false)).unwrap().run().unwrap();

	assert_eq!(file_names(&dir.path().join("samples")), vec!["00000.png", "00001.png"]);
	assert!(summary.grid.is_none());
	assert!(!file_names(dir.path()).iter().any(|n| n.starts_with("grid-")));
	// 3 steps of a 2-image batch, in both preview directories
	assert_eq!(summary.process_frames, 6);
	assert_eq!(summary.process2_frames, 6);
	assert_eq!(file_names(&dir.path().join("process")).len(), 6);
	assert_eq!(file_names(&dir.path().join("process2")).len(), 6);

	let sample = image::open(dir.path().join("samples/00000.png")).unwrap();
	assert_eq!((sample.width(), sample.height()), (16, 16));
}

#[test]
fn counters_continue_across_runs() {
	let dir = tempfile::tempdir().unwrap();
	let config = run_config(dir.path());
	let model = MockModel::new(8);
	let safety = MockSafetyChecker::new(false);

	Txt2ImgRun::new(&config, &model, &safety).unwrap().run().unwrap();
	let second = Txt2ImgRun::new(&config, &model, &safety).unwrap().run().unwrap();

	assert_eq!(file_names(&dir.path().join("samples")), vec!["00000.png", "00001.png", "00002.png", "00003.png"]);
	assert_eq!(second.samples, vec![dir.path().join("samples/00002.png"), dir.path().join("samples/00003.png")]);
	assert_eq!(second.grid, Some(dir.path().join("grid-0001.png")));
	assert!(dir.path().join("grid-0000.png").exists());
	// preview frames of the second run don't overwrite the first
	assert_eq!(file_names(&dir.path().join("process")).len(), 12);
}

#[test]
fn skip_save_writes_only_the_grid() {
	let dir = tempfile::tempdir().unwrap();
	let mut config = run_config(dir.path());
	config.skip_save = true;
	config.n_iter = 2;

	let summary = Txt2ImgRun::new(&config, &MockModel::new(8), &MockSafetyChecker::new(false)).unwrap().run().unwrap();
	assert!(summary.samples.is_empty());
	assert!(file_names(&dir.path().join("samples")).is_empty());

	// 4 images, 2 per row, 16px each with 2px padding
	let grid = image::open(summary.grid.unwrap()).unwrap();
	assert_eq!((grid.width(), grid.height()), (38, 38));
}

#[test]
fn fixed_code_repeats_across_iterations() {
	let dir = tempfile::tempdir().unwrap();
	let mut config = run_config(dir.path());
	config.fixed_code = true;
	config.n_iter = 2;
	config.skip_grid = true;

	Txt2ImgRun::new(&config, &MockModel::new(8), &MockSafetyChecker::new(false)).unwrap().run().unwrap();
	let samples = dir.path().join("samples");
	let first = image::open(samples.join("00000.png")).unwrap().into_rgb8();
	let repeated = image::open(samples.join("00002.png")).unwrap().into_rgb8();
	assert_eq!(first, repeated);

	let other = tempfile::tempdir().unwrap();
	let config = RunConfig {
		outdir: other.path().to_path_buf(),
		..config
	};
	Txt2ImgRun::new(&config, &MockModel::new(8), &MockSafetyChecker::new(false)).unwrap().run().unwrap();
	let rerun = image::open(other.path().join("samples/00000.png")).unwrap().into_rgb8();
	assert_eq!(first, rerun);
}

#[test]
fn flagged_samples_are_replaced() {
	let dir = tempfile::tempdir().unwrap();
	let placeholder = dir.path().join("placeholder.png");
	RgbImage::from_pixel(32, 24, Rgb([0, 255, 0])).save(&placeholder).unwrap();

	let mut config = run_config(&dir.path().join("out"));
	config.placeholder = placeholder;
	config.skip_grid = true;

	let safety = MockSafetyChecker::new(true);
	let summary = Txt2ImgRun::new(&config, &MockModel::new(8), &safety).unwrap().run().unwrap();
	assert_eq!(summary.flagged, 1);
	assert_eq!(safety.calls.get(), 1);

	let replaced = image::open(&summary.samples[0]).unwrap().into_rgb8();
	assert!(replaced.pixels().all(|p| *p == Rgb([0, 255, 0])));
	let kept = image::open(&summary.samples[1]).unwrap().into_rgb8();
	assert!(kept.pixels().any(|p| *p != Rgb([0, 255, 0])));
}

#[test]
fn missing_placeholder_blacks_out() {
	let dir = tempfile::tempdir().unwrap();
	let mut config = run_config(dir.path());
	config.skip_grid = true;

	let summary = Txt2ImgRun::new(&config, &MockModel::new(8), &MockSafetyChecker::new(true)).unwrap().run().unwrap();
	let replaced = image::open(&summary.samples[0]).unwrap().into_rgb8();
	assert!(replaced.pixels().all(|p| *p == Rgb([0, 0, 0])));
}

#[test]
fn prompt_file_with_short_last_batch() {
	let dir = tempfile::tempdir().unwrap();
	let prompts = dir.path().join("prompts.txt");
	fs::write(&prompts, "a red fox\na blue bird\na green frog\n").unwrap();

	let mut config = run_config(&dir.path().join("out"));
	config.prompt = PromptSource::File(prompts);
	config.fixed_code = true;
	config.n_rows = 3;

	let model = MockModel::new(8);
	let summary = Txt2ImgRun::new(&config, &model, &MockSafetyChecker::new(false)).unwrap().run().unwrap();
	assert_eq!(summary.samples.len(), 3);
	// (3 steps + final) decodes for each of the 2 batches, for both preview directories
	assert_eq!(model.decodes.get(), 2 * (3 + 3 + 1));

	let grid = image::open(summary.grid.unwrap()).unwrap();
	assert_eq!((grid.width(), grid.height()), (3 * 18 + 2, 18 + 2));
}

#[test]
fn every_sampler_runs() {
	for sampler in [SamplerKind::Ddim, SamplerKind::Plms, SamplerKind::DpmSolver] {
		let dir = tempfile::tempdir().unwrap();
		let mut config = run_config(dir.path());
		config.sampler = sampler;
		let summary = Txt2ImgRun::new(&config, &MockModel::new(8), &MockSafetyChecker::new(false)).unwrap().run().unwrap();
		assert_eq!(summary.samples.len(), 2, "{sampler}");
		// one frame per sample and step, whatever the number of model evaluations
		assert_eq!(summary.process_frames, 2 * 3, "{sampler}");
		assert_eq!(summary.process2_frames, 2 * 3, "{sampler}");
	}
}

#[test]
fn watermark_stamps_large_samples() {
	let dir = tempfile::tempdir().unwrap();
	let mut config = run_config(dir.path());
	config.height = 256;
	config.width = 256;
	config.batch_size = 1;
	config.n_rows = 1;
	config.steps = 1;
	config.skip_grid = true;
	config.fixed_code = true;

	let plain = Txt2ImgRun::new(&config, &MockModel::low_contrast(8), &MockSafetyChecker::new(false)).unwrap().run().unwrap();
	let plain = image::open(&plain.samples[0]).unwrap().into_rgb8();

	config.watermark = true;
	let marked = Txt2ImgRun::new(&config, &MockModel::low_contrast(8), &MockSafetyChecker::new(false)).unwrap().run().unwrap();
	let marked = image::open(&marked.samples[0]).unwrap().into_rgb8();
	assert_eq!(marked.dimensions(), plain.dimensions());
	assert_ne!(marked, plain);
	let payload = WatermarkDecoder::new(DEFAULT_WATERMARK.len()).decode(&marked).unwrap();
	assert_eq!(payload, DEFAULT_WATERMARK.as_bytes());
}
