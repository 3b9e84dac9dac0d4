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

//! Invisible watermarking with the DWT-DCT method of [invisible-watermark].
//!
//! The payload is hidden in the U plane of the image: a one-level Haar transform yields the approximation band, which
//! is cut into 4×4 blocks. In each block's DCT, the largest AC coefficient is quantized so that its remainder modulo
//! [`SCALE`] encodes one bit of the payload. Bits repeat cyclically over all blocks.
//!
//! [invisible-watermark]: https://github.com/ShieldMnt/invisible-watermark

use std::f32::consts::PI;

use image::{Rgb, RgbImage};
use ndarray::{s, Array2, ArrayViewMut2};

/// The payload stamped on every generated image.
pub const DEFAULT_WATERMARK: &str = "StableDiffusionV1";

/// Quantization step applied to the U plane.
pub const SCALE: f32 = 36.0;

const BLOCK: usize = 4;
const MIN_PIXELS: u32 = 256 * 256;

struct Yuv {
	y: Array2<f32>,
	u: Array2<f32>,
	v: Array2<f32>
}

fn rgb_to_yuv(image: &RgbImage) -> Yuv {
	let (width, height) = image.dimensions();
	let shape = (height as usize, width as usize);
	let (mut y, mut u, mut v) = (Array2::zeros(shape), Array2::zeros(shape), Array2::zeros(shape));
	for (col, row, Rgb([r, g, b])) in image.enumerate_pixels() {
		let (r, g, b) = (*r as f32, *g as f32, *b as f32);
		let luma = 0.299 * r + 0.587 * g + 0.114 * b;
		let idx = (row as usize, col as usize);
		y[idx] = luma;
		u[idx] = 0.492_111 * (b - luma) + 128.0;
		v[idx] = 0.877_283 * (r - luma) + 128.0;
	}
	Yuv { y, u, v }
}

fn yuv_to_rgb(yuv: &Yuv) -> RgbImage {
	let (height, width) = yuv.y.dim();
	RgbImage::from_fn(width as u32, height as u32, |col, row| {
		let idx = (row as usize, col as usize);
		let (y, u, v) = (yuv.y[idx], yuv.u[idx] - 128.0, yuv.v[idx] - 128.0);
		let quantize = |x: f32| x.round().clamp(0.0, 255.0) as u8;
		Rgb([quantize(y + 1.139_83 * v), quantize(y - 0.394_65 * u - 0.580_6 * v), quantize(y + 2.032_11 * u)])
	})
}

/// Approximation band of a one-level orthonormal Haar transform.
fn haar_approximation(plane: &Array2<f32>) -> Array2<f32> {
	let (height, width) = (plane.nrows() / 2, plane.ncols() / 2);
	Array2::from_shape_fn((height, width), |(i, j)| {
		(plane[[2 * i, 2 * j]] + plane[[2 * i, 2 * j + 1]] + plane[[2 * i + 1, 2 * j]] + plane[[2 * i + 1, 2 * j + 1]]) / 2.0
	})
}

/// Orthonormal DCT-II basis, so that `dct(x) = C·x·Cᵀ` and `idct(X) = Cᵀ·X·C`.
fn dct_basis() -> Array2<f32> {
	let n = BLOCK as f32;
	Array2::from_shape_fn((BLOCK, BLOCK), |(k, i)| {
		let alpha = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
		alpha * (PI * (2.0 * i as f32 + 1.0) * k as f32 / (2.0 * n)).cos()
	})
}

/// Position of the largest AC coefficient.
fn dominant_ac(block: &Array2<f32>) -> (usize, usize) {
	let (mut best, mut best_value) = ((0, 1), f32::NEG_INFINITY);
	for ((i, j), value) in block.indexed_iter() {
		if (i, j) != (0, 0) && value.abs() > best_value {
			best = (i, j);
			best_value = value.abs();
		}
	}
	best
}

fn for_each_block(band: &mut Array2<f32>, mut f: impl FnMut(usize, ArrayViewMut2<'_, f32>)) {
	let (rows, cols) = (band.nrows() / BLOCK, band.ncols() / BLOCK);
	for i in 0..rows {
		for j in 0..cols {
			f(i * cols + j, band.slice_mut(s![i * BLOCK..(i + 1) * BLOCK, j * BLOCK..(j + 1) * BLOCK]));
		}
	}
}

fn to_bits(payload: &[u8]) -> Vec<u8> {
	payload.iter().flat_map(|byte| (0..8).rev().map(move |bit| (byte >> bit) & 1)).collect()
}

/// Embeds a fixed payload into images.
#[derive(Debug, Clone)]
pub struct WatermarkEncoder {
	bits: Vec<u8>
}

impl Default for WatermarkEncoder {
	fn default() -> Self {
		Self::new(DEFAULT_WATERMARK.as_bytes())
	}
}

impl WatermarkEncoder {
	pub fn new(payload: &[u8]) -> Self {
		Self { bits: to_bits(payload) }
	}

	/// Number of payload bits.
	pub fn len(&self) -> usize {
		self.bits.len()
	}

	pub fn is_empty(&self) -> bool {
		self.bits.is_empty()
	}

	/// Returns a watermarked copy of `image`.
	///
	/// # Errors
	/// Errors if the image has fewer than 256×256 pixels or the payload is empty.
	pub fn encode(&self, image: &RgbImage) -> anyhow::Result<RgbImage> {
		let (width, height) = image.dimensions();
		anyhow::ensure!(width * height >= MIN_PIXELS, "image too small to watermark ({width}x{height}), should be larger than 256x256");
		anyhow::ensure!(!self.bits.is_empty(), "watermark payload is empty");

		let mut yuv = rgb_to_yuv(image);
		let (rows, cols) = (yuv.u.nrows() / 4 * 4, yuv.u.ncols() / 4 * 4);
		let region = yuv.u.slice(s![..rows, ..cols]).to_owned();
		let original = haar_approximation(&region);
		let mut band = original.clone();

		let basis = dct_basis();
		for_each_block(&mut band, |num, mut block| {
			let mut coefficients = basis.dot(&block).dot(&basis.t());
			let pos = dominant_ac(&coefficients);
			let value = coefficients[pos];
			let bit = self.bits[num % self.bits.len()] as f32;
			coefficients[pos] = value.signum() * ((value.abs() / SCALE).floor() + 0.25 + 0.5 * bit) * SCALE;
			block.assign(&basis.t().dot(&coefficients).dot(&basis));
		});

		// only the approximation band changed, so the inverse transform spreads each delta evenly over its 2x2 block
		let delta = &band - &original;
		for ((i, j), d) in delta.indexed_iter() {
			let d = d / 2.0;
			for (di, dj) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
				yuv.u[[2 * i + di, 2 * j + dj]] += d;
			}
		}

		Ok(yuv_to_rgb(&yuv))
	}
}

/// Reads back a payload embedded by [`WatermarkEncoder`].
#[derive(Debug, Clone)]
pub struct WatermarkDecoder {
	bit_len: usize
}

impl WatermarkDecoder {
	/// Decodes payloads of `byte_len` bytes.
	pub fn new(byte_len: usize) -> Self {
		Self { bit_len: byte_len * 8 }
	}

	/// Recovers the payload. Every bit is decided by majority over the blocks that carry it.
	pub fn decode(&self, image: &RgbImage) -> anyhow::Result<Vec<u8>> {
		anyhow::ensure!(self.bit_len > 0, "payload length must be >0");
		let yuv = rgb_to_yuv(image);
		let (rows, cols) = (yuv.u.nrows() / 4 * 4, yuv.u.ncols() / 4 * 4);
		let mut band = haar_approximation(&yuv.u.slice(s![..rows, ..cols]).to_owned());

		let basis = dct_basis();
		let mut votes = vec![(0usize, 0usize); self.bit_len];
		for_each_block(&mut band, |num, block| {
			let coefficients = basis.dot(&block).dot(&basis.t());
			let value = coefficients[dominant_ac(&coefficients)];
			let vote = &mut votes[num % self.bit_len];
			vote.1 += 1;
			if value.abs() % SCALE > SCALE / 2.0 {
				vote.0 += 1;
			}
		});
		anyhow::ensure!(votes.iter().all(|(_, total)| *total > 0), "image too small to carry a {}-bit payload", self.bit_len);

		Ok(votes
			.chunks(8)
			.map(|byte| byte.iter().fold(0u8, |acc, (ones, total)| (acc << 1) | u8::from(ones * 2 > *total)))
			.collect())
	}
}
