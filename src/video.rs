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

//! Stitching preview frames into an uncompressed AVI.

use std::{
	fs::{self, File},
	io::{BufWriter, Write},
	path::{Path, PathBuf}
};

use anyhow::Context;
use byteorder::{LittleEndian, WriteBytesExt};
use tracing::info;

/// Playback rate of assembled videos.
pub const FPS: u32 = 5;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const MAIN_HEADER_LEN: u32 = 56;
const STREAM_HEADER_LEN: u32 = 56;
const BITMAP_INFO_LEN: u32 = 40;
const INDEX_ENTRY_LEN: u32 = 16;

/// Lists the `*.png` files in `dir`, sorted by file name.
pub fn list_frames(dir: impl AsRef<Path>) -> anyhow::Result<Vec<PathBuf>> {
	let dir = dir.as_ref();
	let mut frames = fs::read_dir(dir)
		.with_context(|| format!("failed to read {}", dir.display()))?
		.filter_map(Result::ok)
		.map(|entry| entry.path())
		.filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "png"))
		.collect::<Vec<_>>();
	frames.sort();
	Ok(frames)
}

/// Frame geometry of an uncompressed 24-bit DIB stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
	width: u32,
	height: u32
}

impl Geometry {
	/// Rows are padded to a multiple of 4 bytes.
	fn stride(&self) -> u64 {
		(u64::from(self.width) * 3 + 3) & !3
	}

	fn frame_len(&self) -> Option<u64> {
		self.stride().checked_mul(u64::from(self.height))
	}
}

/// Sizes of every chunk whose length depends on the frames. RIFF sizes are 32-bit, which caps a file at 4 GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkSizes {
	frame: u32,
	strl: u32,
	hdrl: u32,
	movi: u32,
	idx1: u32,
	riff: u32
}

impl ChunkSizes {
	fn new(geometry: Geometry, frames: u32) -> anyhow::Result<Self> {
		let too_large = || anyhow::anyhow!("{frames} frames of {}x{} exceed the 4 GiB AVI size limit", geometry.width, geometry.height);
		let to_u32 = |len: u64| u32::try_from(len).map_err(|_| too_large());

		let frame = geometry.frame_len().ok_or_else(too_large)?;
		let movi = frame
			.checked_add(8)
			.and_then(|chunk| chunk.checked_mul(u64::from(frames)))
			.and_then(|len| len.checked_add(4))
			.ok_or_else(too_large)?;
		let movi = to_u32(movi)?;
		let strl = 4 + (8 + STREAM_HEADER_LEN) + (8 + BITMAP_INFO_LEN);
		let hdrl = 4 + (8 + MAIN_HEADER_LEN) + (8 + strl);
		let idx1 = to_u32(u64::from(frames) * u64::from(INDEX_ENTRY_LEN))?;
		let riff = to_u32(4 + u64::from(8 + hdrl) + (8 + u64::from(movi)) + (8 + u64::from(idx1)))?;

		Ok(Self {
			frame: to_u32(frame)?,
			strl,
			hdrl,
			movi,
			idx1,
			riff
		})
	}
}

struct AviWriter<W: Write> {
	inner: W,
	geometry: Geometry,
	sizes: ChunkSizes,
	frames: u32,
	written: u32
}

impl<W: Write> AviWriter<W> {
	/// Fails if `frames` frames of this size don't fit in a single RIFF file.
	fn new(inner: W, geometry: Geometry, frames: u32) -> anyhow::Result<Self> {
		Ok(Self {
			inner,
			geometry,
			sizes: ChunkSizes::new(geometry, frames)?,
			frames,
			written: 0
		})
	}

	fn fourcc(&mut self, code: &[u8; 4]) -> std::io::Result<()> {
		self.inner.write_all(code)
	}

	fn write_headers(&mut self) -> anyhow::Result<()> {
		let Geometry { width, height } = self.geometry;
		let ChunkSizes { frame: frame_len, strl, hdrl, movi, riff, .. } = self.sizes;

		self.fourcc(b"RIFF")?;
		self.inner.write_u32::<LittleEndian>(riff)?;
		self.fourcc(b"AVI ")?;

		self.fourcc(b"LIST")?;
		self.inner.write_u32::<LittleEndian>(hdrl)?;
		self.fourcc(b"hdrl")?;

		self.fourcc(b"avih")?;
		self.inner.write_u32::<LittleEndian>(MAIN_HEADER_LEN)?;
		self.inner.write_u32::<LittleEndian>(1_000_000 / FPS)?;
		self.inner.write_u32::<LittleEndian>(frame_len.saturating_mul(FPS))?;
		self.inner.write_u32::<LittleEndian>(0)?;
		self.inner.write_u32::<LittleEndian>(AVIF_HASINDEX)?;
		self.inner.write_u32::<LittleEndian>(self.frames)?;
		self.inner.write_u32::<LittleEndian>(0)?;
		self.inner.write_u32::<LittleEndian>(1)?;
		self.inner.write_u32::<LittleEndian>(frame_len)?;
		self.inner.write_u32::<LittleEndian>(width)?;
		self.inner.write_u32::<LittleEndian>(height)?;
		self.inner.write_all(&[0; 16])?;

		self.fourcc(b"LIST")?;
		self.inner.write_u32::<LittleEndian>(strl)?;
		self.fourcc(b"strl")?;

		self.fourcc(b"strh")?;
		self.inner.write_u32::<LittleEndian>(STREAM_HEADER_LEN)?;
		self.fourcc(b"vids")?;
		self.fourcc(b"DIB ")?;
		self.inner.write_u32::<LittleEndian>(0)?;
		self.inner.write_u16::<LittleEndian>(0)?;
		self.inner.write_u16::<LittleEndian>(0)?;
		self.inner.write_u32::<LittleEndian>(0)?;
		// rate / scale = frames per second
		self.inner.write_u32::<LittleEndian>(1)?;
		self.inner.write_u32::<LittleEndian>(FPS)?;
		self.inner.write_u32::<LittleEndian>(0)?;
		self.inner.write_u32::<LittleEndian>(self.frames)?;
		self.inner.write_u32::<LittleEndian>(frame_len)?;
		self.inner.write_u32::<LittleEndian>(u32::MAX)?;
		self.inner.write_u32::<LittleEndian>(frame_len)?;
		self.inner.write_i16::<LittleEndian>(0)?;
		self.inner.write_i16::<LittleEndian>(0)?;
		self.inner.write_i16::<LittleEndian>(i16::try_from(width)?)?;
		self.inner.write_i16::<LittleEndian>(i16::try_from(height)?)?;

		self.fourcc(b"strf")?;
		self.inner.write_u32::<LittleEndian>(BITMAP_INFO_LEN)?;
		self.inner.write_u32::<LittleEndian>(BITMAP_INFO_LEN)?;
		// positive height: rows are stored bottom-up
		self.inner.write_i32::<LittleEndian>(i32::try_from(width)?)?;
		self.inner.write_i32::<LittleEndian>(i32::try_from(height)?)?;
		self.inner.write_u16::<LittleEndian>(1)?;
		self.inner.write_u16::<LittleEndian>(24)?;
		self.inner.write_u32::<LittleEndian>(0)?;
		self.inner.write_u32::<LittleEndian>(frame_len)?;
		self.inner.write_all(&[0; 16])?;

		self.fourcc(b"LIST")?;
		self.inner.write_u32::<LittleEndian>(movi)?;
		self.fourcc(b"movi")?;
		Ok(())
	}

	fn write_frame(&mut self, frame: &image::RgbImage) -> anyhow::Result<()> {
		anyhow::ensure!(self.written < self.frames, "more frames than announced in the header");
		let stride = usize::try_from(self.geometry.stride())?;
		let mut row_buf = vec![0u8; stride];

		self.fourcc(b"00db")?;
		self.inner.write_u32::<LittleEndian>(self.sizes.frame)?;
		for row in (0..frame.height()).rev() {
			for x in 0..frame.width() {
				let [r, g, b] = frame.get_pixel(x, row).0;
				row_buf[x as usize * 3..x as usize * 3 + 3].copy_from_slice(&[b, g, r]);
			}
			self.inner.write_all(&row_buf)?;
		}
		self.written += 1;
		Ok(())
	}

	fn finish(mut self) -> anyhow::Result<W> {
		anyhow::ensure!(self.written == self.frames, "wrote {} of {} frames", self.written, self.frames);
		let ChunkSizes { frame: frame_len, idx1, .. } = self.sizes;
		self.fourcc(b"idx1")?;
		self.inner.write_u32::<LittleEndian>(idx1)?;
		// offsets are relative to the `movi` fourcc; the last one stays below the checked `movi` size
		let mut offset = 4u32;
		for _ in 0..self.frames {
			self.fourcc(b"00db")?;
			self.inner.write_u32::<LittleEndian>(AVIIF_KEYFRAME)?;
			self.inner.write_u32::<LittleEndian>(offset)?;
			self.inner.write_u32::<LittleEndian>(frame_len)?;
			offset = offset.saturating_add(8 + frame_len);
		}
		self.inner.flush()?;
		Ok(self.inner)
	}
}

/// Writes every `*.png` in `image_folder`, in file name order, as frames of an uncompressed AVI at [`FPS`] frames per
/// second. The first frame decides the video size; every other frame must match it. Returns the number of frames.
pub fn write_video(video_name: impl AsRef<Path>, image_folder: impl AsRef<Path>) -> anyhow::Result<usize> {
	let (video_name, image_folder) = (video_name.as_ref(), image_folder.as_ref());
	let frames = list_frames(image_folder)?;
	let first = frames.first().with_context(|| format!("no PNG frames found in {}", image_folder.display()))?;

	let (width, height) = image::image_dimensions(first).with_context(|| format!("failed to read {}", first.display()))?;
	let geometry = Geometry { width, height };
	let file = File::create(video_name).with_context(|| format!("failed to create {}", video_name.display()))?;
	let mut writer = AviWriter::new(BufWriter::new(file), geometry, u32::try_from(frames.len())?)?;

	writer.write_headers()?;
	for path in &frames {
		let frame = image::open(path).with_context(|| format!("failed to read {}", path.display()))?.into_rgb8();
		anyhow::ensure!(
			frame.dimensions() == (width, height),
			"frame {} is {}x{}, expected {width}x{height}",
			path.display(),
			frame.width(),
			frame.height()
		);
		writer.write_frame(&frame)?;
	}
	writer.finish()?;

	info!("wrote {} frames to {}", frames.len(), video_name.display());
	Ok(frames.len())
}

#[cfg(test)]
mod tests {
	use image::{Rgb, RgbImage};

	use super::*;

	#[test]
	fn test_stride_padding() {
		assert_eq!(Geometry { width: 5, height: 2 }.stride(), 16);
		assert_eq!(Geometry { width: 4, height: 2 }.stride(), 12);
		assert_eq!(Geometry { width: 5, height: 2 }.frame_len(), Some(32));
	}

	#[test]
	fn test_size_limit() {
		let geometry = Geometry { width: 512, height: 512 };
		// 5461 frames of 786432 bytes are the most that fit in 4 GiB
		let mut writer = AviWriter::new(std::io::sink(), geometry, 5461).unwrap();
		writer.write_headers().unwrap();
		assert_eq!(writer.sizes.movi, 4 + 5461 * (8 + 786_432));
		assert!(writer.sizes.riff > writer.sizes.movi);

		let err = AviWriter::new(std::io::sink(), geometry, 5462).err().unwrap();
		assert!(err.to_string().contains("exceed the 4 GiB AVI size limit"));
		assert!(AviWriter::new(std::io::sink(), Geometry { width: u32::MAX, height: u32::MAX }, 1).is_err());
	}

	#[test]
	fn test_frame_is_bottom_up_bgr() {
		let mut frame = RgbImage::new(1, 2);
		frame.put_pixel(0, 0, Rgb([1, 2, 3]));
		frame.put_pixel(0, 1, Rgb([4, 5, 6]));

		let mut writer = AviWriter::new(Vec::new(), Geometry { width: 1, height: 2 }, 1).unwrap();
		writer.write_frame(&frame).unwrap();
		let bytes = writer.inner;
		assert_eq!(&bytes[..4], b"00db");
		assert_eq!(&bytes[8..], &[6, 5, 4, 0, 3, 2, 1, 0]);
	}

	#[test]
	fn test_sorted_frames_only_png() {
		let dir = tempfile::tempdir().unwrap();
		for name in ["00002.png", "00000.png", "00001.png", "notes.txt"] {
			fs::write(dir.path().join(name), b"").unwrap();
		}
		let frames = list_frames(dir.path()).unwrap();
		let names = frames.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect::<Vec<_>>();
		assert_eq!(names, vec!["00000.png", "00001.png", "00002.png"]);
	}

	#[test]
	fn test_empty_folder() {
		let dir = tempfile::tempdir().unwrap();
		let err = write_video(dir.path().join("out.avi"), dir.path()).unwrap_err();
		assert!(err.to_string().starts_with("no PNG frames found in"));
	}
}
