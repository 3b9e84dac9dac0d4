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

//! Turning decoded tensors into image files.

use std::{
	fs,
	path::{Path, PathBuf}
};

use anyhow::Context;
use image::{GenericImage, Rgb, RgbImage};
use ndarray::{Array3, Array4, ArrayView3, ArrayView4};

/// Maps decoder output (`[batch, 3, height, width]` in `[-1, 1]`) to `[batch, height, width, 3]` in `[0, 1]`.
pub fn to_unit_range(decoded: ArrayView4<'_, f32>) -> Array4<f32> {
	let mut images = decoded.permuted_axes([0, 2, 3, 1]).as_standard_layout().into_owned();
	images.par_map_inplace(|x| *x = ((*x + 1.0) / 2.0).clamp(0.0, 1.0));
	images
}

/// Quantizes one `[height, width, 3]` image in `[0, 1]`. Values are truncated, not rounded.
pub fn to_image(image: ArrayView3<'_, f32>) -> anyhow::Result<RgbImage> {
	let (height, width, channels) = image.dim();
	anyhow::ensure!(channels == 3, "expected 3 channels, got {channels}");
	let raw = image.iter().map(|x| (x * 255.0) as u8).collect::<Vec<_>>();
	RgbImage::from_raw(width as u32, height as u32, raw).context("image buffer has the wrong size")
}

/// Quantizes a `[batch, height, width, 3]` batch in `[0, 1]`.
pub fn to_images(images: ArrayView4<'_, f32>) -> anyhow::Result<Vec<RgbImage>> {
	images.outer_iter().map(to_image).collect()
}

/// Converts an 8-bit image to `[height, width, 3]` in `[0, 1]`.
pub fn from_image(image: &RgbImage) -> Array3<f32> {
	let (width, height) = image.dimensions();
	Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0)
}

/// Lays `images` out in a grid of `nrow` images per row with 2 pixels of black padding around and between them.
pub fn make_grid(images: &[RgbImage], nrow: usize) -> anyhow::Result<RgbImage> {
	const PADDING: u32 = 2;

	let first = images.first().context("cannot make a grid of zero images")?;
	let (width, height) = first.dimensions();
	anyhow::ensure!(images.iter().all(|i| i.dimensions() == (width, height)), "grid images must all have the same size");

	let xmaps = nrow.clamp(1, images.len()) as u32;
	let ymaps = (images.len() as u32 + xmaps - 1) / xmaps;
	let (cell_width, cell_height) = (width + PADDING, height + PADDING);

	let mut grid = RgbImage::from_pixel(xmaps * cell_width + PADDING, ymaps * cell_height + PADDING, Rgb([0, 0, 0]));
	for (k, image) in images.iter().enumerate() {
		let (x, y) = (k as u32 % xmaps, k as u32 / xmaps);
		grid.copy_from(image, x * cell_width + PADDING, y * cell_height + PADDING)?;
	}
	Ok(grid)
}

/// Hands out zero-padded file names that keep increasing across calls.
#[derive(Debug, Clone)]
pub struct FileCounter {
	dir: PathBuf,
	prefix: &'static str,
	digits: usize,
	next: usize
}

impl FileCounter {
	/// Starts after the number of entries already in `dir`.
	pub fn for_dir(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
		let dir = dir.into();
		let next = fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?.count();
		Ok(Self { dir, prefix: "", digits: 5, next })
	}

	/// Starts after the number of `grid-*.png` files already in `dir`.
	pub fn for_grids(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
		let dir = dir.into();
		let next = fs::read_dir(&dir)
			.with_context(|| format!("failed to read {}", dir.display()))?
			.filter_map(Result::ok)
			.filter(|entry| {
				let name = entry.file_name();
				let name = name.to_string_lossy();
				name.starts_with("grid-") && name.ends_with(".png")
			})
			.count();
		Ok(Self { dir, prefix: "grid-", digits: 4, next })
	}

	/// The counter value the next file will get.
	pub fn peek(&self) -> usize {
		self.next
	}

	/// Reserves the next file name.
	pub fn next_path(&mut self) -> PathBuf {
		let path = self.dir.join(format!("{}{:0width$}.png", self.prefix, self.next, width = self.digits));
		self.next += 1;
		path
	}

	/// Saves `image` under the next file name and returns the path.
	pub fn save(&mut self, image: &RgbImage) -> anyhow::Result<PathBuf> {
		let path = self.next_path();
		image.save(&path).with_context(|| format!("failed to save {}", path.display()))?;
		Ok(path)
	}
}

/// The output directory tree of a run.
#[derive(Debug, Clone)]
pub struct OutputDirs {
	pub root: PathBuf,
	pub samples: PathBuf,
	pub process: PathBuf,
	pub process2: PathBuf
}

impl OutputDirs {
	/// Creates `root` and its `samples`, `process` and `process2` subdirectories if they don't exist yet.
	pub fn create(root: impl AsRef<Path>) -> anyhow::Result<Self> {
		let root = root.as_ref().to_path_buf();
		let dirs = Self {
			samples: root.join("samples"),
			process: root.join("process"),
			process2: root.join("process2"),
			root
		};
		for dir in [&dirs.root, &dirs.samples, &dirs.process, &dirs.process2] {
			fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
		}
		Ok(dirs)
	}
}
