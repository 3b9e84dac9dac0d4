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

//! Content safety filtering of generated images.

use std::{fs, path::Path, sync::Arc};

use anyhow::Context;
use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::{Array2, Array3, Array4, ArrayView4, ArrayViewMut4, Axis, IxDyn};
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor},
	Environment, GraphOptimizationLevel, Session, SessionBuilder
};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::postprocess::from_image;
use crate::{config::CLIPFeatureExtractorConfig, DiffusionDevice};

/// Classifies generated images as safe or unsafe.
pub trait SafetyChecker {
	/// Returns one verdict per image; `true` means the image was flagged. `images` is `[batch, height, width, 3]` in
	/// `[0, 1]`.
	fn check(&self, images: ArrayView4<'_, f32>) -> anyhow::Result<Vec<bool>>;
}

/// Quantizes with rounding, the way images are handed to the feature extractor.
fn to_rounded_image(image: ndarray::ArrayView3<'_, f32>) -> anyhow::Result<RgbImage> {
	let (height, width, _) = image.dim();
	let raw = image.iter().map(|x| (x * 255.0).round().clamp(0.0, 255.0) as u8).collect::<Vec<_>>();
	RgbImage::from_raw(width as u32, height as u32, raw).context("image buffer has the wrong size")
}

/// Turns images into CLIP vision model input: shortest edge resized to `size`, center cropped to `crop-size`, then
/// normalized per channel.
#[derive(Debug, Clone)]
pub struct CLIPFeatureExtractor {
	config: CLIPFeatureExtractorConfig
}

impl CLIPFeatureExtractor {
	pub fn new(config: CLIPFeatureExtractorConfig) -> anyhow::Result<Self> {
		anyhow::ensure!(
			config.image_mean.len() == 3 && config.image_std.len() == 3,
			"feature extractor needs 3 mean and 3 std values, got {} and {}",
			config.image_mean.len(),
			config.image_std.len()
		);
		anyhow::ensure!(config.image_std.iter().all(|s| *s != 0.0), "feature extractor std must be non-zero");
		Ok(Self { config })
	}

	fn preprocess_one(&self, image: RgbImage) -> Array3<f32> {
		let config = &self.config;
		let mut image = DynamicImage::ImageRgb8(image);
		if config.do_resize {
			let (width, height) = (image.width(), image.height());
			let scale = config.size as f32 / width.min(height) as f32;
			let (new_width, new_height) = (((width as f32 * scale).round() as u32).max(1), ((height as f32 * scale).round() as u32).max(1));
			image = image.resize_exact(new_width, new_height, FilterType::CatmullRom);
		}
		if config.do_center_crop {
			let crop = config.crop_size;
			let left = image.width().saturating_sub(crop) / 2;
			let top = image.height().saturating_sub(crop) / 2;
			image = image.crop_imm(left, top, crop.min(image.width()), crop.min(image.height()));
		}

		let image = image.into_rgb8();
		let mut pixels = from_image(&image).permuted_axes([2, 0, 1]).as_standard_layout().into_owned();
		if config.do_normalize {
			for (c, mut channel) in pixels.axis_iter_mut(Axis(0)).enumerate() {
				let (mean, std) = (config.image_mean[c], config.image_std[c]);
				channel.mapv_inplace(|x| (x - mean) / std);
			}
		}
		pixels
	}

	/// `[batch, height, width, 3]` in `[0, 1]` to `[batch, 3, crop, crop]` pixel values.
	pub fn preprocess(&self, images: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let images = images.outer_iter().map(to_rounded_image).collect::<anyhow::Result<Vec<_>>>()?;
		let pixels = images
			.into_par_iter()
			.map(|image| self.preprocess_one(image).insert_axis(Axis(0)))
			.collect::<Vec<_>>();
		let views = pixels.iter().map(|p| p.view()).collect::<Vec<_>>();
		Ok(ndarray::concatenate(Axis(0), &views)?)
	}
}

/// Interprets per-concept scores: an image is flagged if any of its scores is positive.
pub fn flagged_from_scores(scores: &Array2<f32>) -> Vec<bool> {
	scores.outer_iter().map(|row| row.iter().any(|score| *score > 0.0)).collect()
}

/// The CLIP-based safety classifier, exported to ONNX.
///
/// The directory must contain `safety_checker.onnx`, which takes `clip_input` (`[batch, 3, crop, crop]`) and returns
/// `[batch, concepts]` scores, and the feature extractor's `preprocessor_config.json`.
pub struct OnnxSafetyChecker {
	session: Session,
	feature_extractor: CLIPFeatureExtractor
}

impl OnnxSafetyChecker {
	pub fn load(environment: &Arc<Environment>, root: impl AsRef<Path>, device: DiffusionDevice) -> anyhow::Result<Self> {
		let root = root.as_ref();
		info!("Loading safety checker from {}", root.display());

		let preprocessor_path = root.join("preprocessor_config.json");
		let config: CLIPFeatureExtractorConfig = serde_json::from_slice(
			&fs::read(&preprocessor_path).with_context(|| format!("failed to read {}", preprocessor_path.display()))?
		)
		.with_context(|| format!("malformed feature extractor config {}", preprocessor_path.display()))?;

		let model_path = root.join("safety_checker.onnx");
		let session = SessionBuilder::new(environment)?
			.with_optimization_level(GraphOptimizationLevel::Level3)?
			.with_execution_providers([device.into()])?
			.with_model_from_file(&model_path)
			.with_context(|| format!("failed to load {}", model_path.display()))?;

		Ok(Self {
			session,
			feature_extractor: CLIPFeatureExtractor::new(config)?
		})
	}
}

impl SafetyChecker for OnnxSafetyChecker {
	fn check(&self, images: ArrayView4<'_, f32>) -> anyhow::Result<Vec<bool>> {
		let clip_input = self.feature_extractor.preprocess(images)?;
		let outputs = self.session.run(vec![InputTensor::from_array(clip_input.into_dyn())])?;
		let scores: OrtOwnedTensor<'_, f32, IxDyn> = outputs[0].try_extract()?;
		let scores: Array2<f32> = scores.view().to_owned().into_dimensionality()?;
		anyhow::ensure!(scores.shape()[0] == images.shape()[0], "safety checker returned {} verdicts for {} images", scores.shape()[0], images.shape()[0]);
		Ok(flagged_from_scores(&scores))
	}
}

/// Loads the replacement image for a flagged sample, resized to `width`×`height`, as `[height, width, 3]` in `[0, 1]`.
///
/// If the placeholder can't be loaded, a black image is returned instead so that flagged content never passes through.
pub fn load_replacement(placeholder: &Path, width: u32, height: u32) -> Array3<f32> {
	match image::open(placeholder) {
		Ok(image) => from_image(&image.resize_exact(width, height, FilterType::CatmullRom).into_rgb8()),
		Err(e) => {
			warn!("failed to load placeholder {}: {e}; using a black image", placeholder.display());
			Array3::zeros((height as usize, width as usize, 3))
		}
	}
}

/// Replaces every flagged image in `images` (`[batch, height, width, 3]`) with the placeholder. Returns the number of
/// replaced images.
pub fn apply_safety(mut images: ArrayViewMut4<'_, f32>, flagged: &[bool], placeholder: &Path) -> anyhow::Result<usize> {
	anyhow::ensure!(images.shape()[0] == flagged.len(), "got {} safety verdicts for {} images", flagged.len(), images.shape()[0]);
	let (height, width) = (images.shape()[1], images.shape()[2]);

	let mut replacement = None;
	let mut replaced = 0;
	for (mut image, _) in images.outer_iter_mut().zip(flagged).filter(|(_, flagged)| **flagged) {
		let replacement = replacement.get_or_insert_with(|| load_replacement(placeholder, width as u32, height as u32));
		image.assign(&*replacement);
		replaced += 1;
	}
	if replaced > 0 {
		debug!("replaced {replaced} flagged images");
	}
	Ok(replaced)
}

#[cfg(test)]
mod tests {
	use image::Rgb;
	use ndarray::{arr2, Array4};

	use super::*;

	fn extractor() -> CLIPFeatureExtractor {
		CLIPFeatureExtractor::new(CLIPFeatureExtractorConfig {
			size: 4,
			crop_size: 4,
			do_resize: true,
			do_center_crop: true,
			do_normalize: true,
			image_mean: vec![0.5, 0.5, 0.5],
			image_std: vec![0.5, 0.5, 0.5]
		})
		.unwrap()
	}

	#[test]
	fn test_feature_extractor_shape() {
		let images = Array4::<f32>::ones((2, 8, 12, 3));
		let pixels = extractor().preprocess(images.view()).unwrap();
		assert_eq!(pixels.shape(), &[2, 3, 4, 4]);
		// white normalizes to (1 - 0.5) / 0.5
		assert!(pixels.iter().all(|x| (x - 1.0).abs() < 1e-5));
	}

	#[test]
	fn test_flagged_from_scores() {
		let scores = arr2(&[[-0.1, -0.2], [-0.3, 0.01], [0.0, -1.0]]);
		assert_eq!(flagged_from_scores(&scores), vec![false, true, false]);
	}

	#[test]
	fn test_replacement_resized() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("placeholder.png");
		RgbImage::from_pixel(10, 10, Rgb([255, 0, 255])).save(&path).unwrap();

		let mut images = Array4::<f32>::from_elem((3, 4, 6, 3), 0.25);
		let replaced = apply_safety(images.view_mut(), &[false, true, false], &path).unwrap();
		assert_eq!(replaced, 1);
		assert!(images.index_axis(Axis(0), 0).iter().all(|x| *x == 0.25));
		assert!(images.index_axis(Axis(0), 2).iter().all(|x| *x == 0.25));
		let flagged = images.index_axis(Axis(0), 1);
		assert_eq!(flagged[[0, 0, 0]], 1.0);
		assert_eq!(flagged[[3, 5, 1]], 0.0);
		assert_eq!(flagged[[2, 3, 2]], 1.0);
	}

	#[test]
	fn test_missing_placeholder_blacks_out() {
		let mut images = Array4::<f32>::from_elem((1, 4, 4, 3), 0.75);
		let replaced = apply_safety(images.view_mut(), &[true], Path::new("/no/such/placeholder.jpeg")).unwrap();
		assert_eq!(replaced, 1);
		assert!(images.iter().all(|x| *x == 0.0));
	}

	#[test]
	fn test_verdict_count_mismatch() {
		let mut images = Array4::<f32>::zeros((2, 4, 4, 3));
		assert!(apply_safety(images.view_mut(), &[true], Path::new("unused")).is_err());
	}
}
