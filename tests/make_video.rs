use std::fs;

use byteorder::{ByteOrder, LittleEndian};
use image::{Rgb, RgbImage};
use ldm_txt2img::video::{write_video, FPS};

#[test]
fn assembles_frames_into_avi() {
	let dir = tempfile::tempdir().unwrap();
	let frames = dir.path().join("process");
	fs::create_dir(&frames).unwrap();
	for i in 0..3u8 {
		RgbImage::from_pixel(5, 3, Rgb([i * 80, 0, 0])).save(frames.join(format!("{i:05}.png"))).unwrap();
	}
	fs::write(frames.join("readme.txt"), b"not a frame").unwrap();

	let video = dir.path().join("video1.avi");
	assert_eq!(write_video(&video, &frames).unwrap(), 3);

	let bytes = fs::read(&video).unwrap();
	assert_eq!(&bytes[0..4], b"RIFF");
	assert_eq!(LittleEndian::read_u32(&bytes[4..8]) as usize, bytes.len() - 8);
	assert_eq!(&bytes[8..12], b"AVI ");
	// main header
	assert_eq!(&bytes[24..28], b"avih");
	assert_eq!(LittleEndian::read_u32(&bytes[32..36]), 1_000_000 / FPS);
	assert_eq!(LittleEndian::read_u32(&bytes[48..52]), 3);
	assert_eq!(LittleEndian::read_u32(&bytes[64..68]), 5);
	assert_eq!(LittleEndian::read_u32(&bytes[68..72]), 3);
	// stream header: rate / scale
	assert_eq!(&bytes[100..104], b"strh");
	assert_eq!(&bytes[108..112], b"vids");
	assert_eq!(LittleEndian::read_u32(&bytes[128..132]), 1);
	assert_eq!(LittleEndian::read_u32(&bytes[132..136]), FPS);

	// 5 pixels * 3 bytes padded to 16, times 3 rows
	let frame_chunks = bytes.windows(4).filter(|w| *w == b"00db").count();
	assert_eq!(frame_chunks, 3 + 3);
	let idx1 = bytes.len() - (8 + 3 * 16);
	assert_eq!(&bytes[idx1..idx1 + 4], b"idx1");
	assert_eq!(LittleEndian::read_u32(&bytes[idx1 + 8 + 12..idx1 + 8 + 16]), 48);
}

#[test]
fn rejects_mismatched_frames() {
	let dir = tempfile::tempdir().unwrap();
	RgbImage::new(4, 4).save(dir.path().join("00000.png")).unwrap();
	RgbImage::new(8, 4).save(dir.path().join("00001.png")).unwrap();
	assert!(write_video(dir.path().join("out.avi"), dir.path()).is_err());
}

#[test]
fn empty_folder_is_an_error() {
	let dir = tempfile::tempdir().unwrap();
	let err = write_video(dir.path().join("out.avi"), dir.path()).unwrap_err();
	assert_eq!(err.to_string(), format!("no PNG frames found in {}", dir.path().display()));
}
