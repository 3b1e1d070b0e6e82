//! FLV recorder
//!
//! Writes audio/video messages of a stream to an FLV file. Tag timestamps are
//! rebuilt from the per-message deltas the stream hands in, summed per media
//! type from zero at [`FlvRecorder::open`]. Script data shares the video
//! clock, the same way data messages are stamped on the wire.
//!
//! Frames may come from the connection worker and from encoder threads at the
//! same time, so the file sits behind one lock. Tag bytes are built before
//! the lock is taken; only the clock update and the write happen under it.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::media::flv::{
    file_header, FlvTag, FlvTagType, FILE_HEADER_SIZE, FLAG_AUDIO, FLAG_VIDEO, SIGNATURE,
};

struct RecorderInner {
    writer: BufWriter<File>,
    audio_clock: u32,
    video_clock: u32,
    tags_written: u64,
}

/// Appends FLV tags to a file
pub struct FlvRecorder {
    path: PathBuf,
    inner: Mutex<Option<RecorderInner>>,
}

impl FlvRecorder {
    /// Open `path` for recording
    ///
    /// A new (or empty) file gets the FLV header. An existing recording is
    /// appended to: the header is left alone and writing resumes at the end.
    /// Anything else is refused with [`std::io::ErrorKind::InvalidData`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len > 0 {
            let mut signature = [0u8; 3];
            let is_flv = len >= FILE_HEADER_SIZE as u64
                && file.read_exact(&mut signature).is_ok()
                && &signature == SIGNATURE;
            if !is_flv {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{} is not an FLV file", path.display()),
                )));
            }
        }

        let mut writer = BufWriter::new(file);
        if len == 0 {
            writer.write_all(&file_header(FLAG_AUDIO | FLAG_VIDEO))?;
        } else {
            writer.seek(SeekFrom::End(0))?;
        }

        tracing::debug!(path = %path.display(), appending = len > 0, "Recorder opened");

        Ok(Self {
            path,
            inner: Mutex::new(Some(RecorderInner {
                writer,
                audio_clock: 0,
                video_clock: 0,
                tags_written: 0,
            })),
        })
    }

    /// Destination path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Number of tags written since open
    pub fn tags_written(&self) -> u64 {
        self.inner.lock().as_ref().map_or(0, |inner| inner.tags_written)
    }

    /// Write one tag
    ///
    /// `delta` is the time since the previous message of the same media
    /// type. The tag is stamped with the running sum for that media type.
    pub fn append(&self, tag_type: FlvTagType, delta: u32, payload: Bytes) -> Result<()> {
        let tag = FlvTag {
            tag_type,
            timestamp: 0,
            data: payload,
        };
        let mut buf = BytesMut::with_capacity(tag.encoded_len());
        tag.write_to(&mut buf);

        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(Error::RecorderClosed)?;

        let clock = match tag_type {
            FlvTagType::Audio => &mut inner.audio_clock,
            FlvTagType::Video | FlvTagType::Script => &mut inner.video_clock,
        };
        *clock = clock.wrapping_add(delta);
        set_tag_timestamp(&mut buf, *clock);

        inner.writer.write_all(&buf)?;
        inner.tags_written += 1;
        Ok(())
    }

    /// Flush and release the file. Later appends fail with `RecorderClosed`.
    pub fn close(&self) -> Result<()> {
        let Some(mut inner) = self.inner.lock().take() else {
            return Ok(());
        };
        inner.writer.flush()?;
        tracing::debug!(path = %self.path.display(), tags = inner.tags_written, "Recorder closed");
        Ok(())
    }
}

/// Patch the timestamp of an encoded tag: 24 low bits, then the extension byte
fn set_tag_timestamp(tag: &mut [u8], timestamp: u32) {
    tag[4] = (timestamp >> 16) as u8;
    tag[5] = (timestamp >> 8) as u8;
    tag[6] = timestamp as u8;
    tag[7] = (timestamp >> 24) as u8;
}

impl std::fmt::Debug for FlvRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlvRecorder")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for FlvRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to flush recording");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "rtmp-client-{}-{}.flv",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn read_tags(path: &Path) -> (Vec<u8>, Vec<FlvTag>) {
        let data = std::fs::read(path).unwrap();
        let mut tags = Vec::new();
        let mut offset = FILE_HEADER_SIZE;
        while offset < data.len() {
            let (tag, used) = FlvTag::parse(&data[offset..]).unwrap();
            tags.push(tag);
            offset += used;
        }
        (data, tags)
    }

    #[test]
    fn test_trailing_size_fields() {
        let path = temp_path("trailing");
        let recorder = FlvRecorder::open(&path).unwrap();
        recorder.append(FlvTagType::Video, 0, Bytes::from_static(&[0x17; 10])).unwrap();
        recorder.append(FlvTagType::Audio, 0, Bytes::from_static(&[0xAF; 5])).unwrap();
        recorder.close().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..13], &[0x46, 0x4C, 0x56, 0x01, 0x05, 0, 0, 0, 9, 0, 0, 0, 0]);

        // First tag: 11 + 10 + 4 bytes
        let second = 13 + 11 + 10 + 4;
        assert_eq!(&data[second - 4..second], &21u32.to_be_bytes());
        assert_eq!(data[second], 8);
        assert_eq!(&data[second + 1..second + 4], &[0, 0, 5]);
        assert_eq!(&data[data.len() - 4..], &16u32.to_be_bytes());
        assert_eq!(data.len(), second + 11 + 5 + 4);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_timestamps_accumulate_per_media_type() {
        let path = temp_path("clocks");
        let recorder = FlvRecorder::open(&path).unwrap();
        recorder.append(FlvTagType::Video, 0, Bytes::from_static(b"v0")).unwrap();
        recorder.append(FlvTagType::Audio, 0, Bytes::from_static(b"a0")).unwrap();
        recorder.append(FlvTagType::Audio, 23, Bytes::from_static(b"a1")).unwrap();
        recorder.append(FlvTagType::Video, 33, Bytes::from_static(b"v1")).unwrap();
        recorder.append(FlvTagType::Script, 0, Bytes::from_static(b"s0")).unwrap();
        recorder.append(FlvTagType::Audio, 23, Bytes::from_static(b"a2")).unwrap();
        recorder.append(FlvTagType::Video, 0x0100_0000, Bytes::from_static(b"v2")).unwrap();
        assert_eq!(recorder.tags_written(), 7);
        recorder.close().unwrap();

        let (_, tags) = read_tags(&path);
        let stamps: Vec<(FlvTagType, u32)> = tags.iter().map(|t| (t.tag_type, t.timestamp)).collect();
        assert_eq!(
            stamps,
            vec![
                (FlvTagType::Video, 0),
                (FlvTagType::Audio, 0),
                (FlvTagType::Audio, 23),
                (FlvTagType::Video, 33),
                (FlvTagType::Script, 33),
                (FlvTagType::Audio, 46),
                (FlvTagType::Video, 33 + 0x0100_0000),
            ]
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_reopen_appends_without_second_header() {
        let path = temp_path("reopen");
        {
            let recorder = FlvRecorder::open(&path).unwrap();
            recorder.append(FlvTagType::Video, 0, Bytes::from_static(b"first")).unwrap();
        }
        {
            let recorder = FlvRecorder::open(&path).unwrap();
            recorder.append(FlvTagType::Video, 0, Bytes::from_static(b"second")).unwrap();
            recorder.close().unwrap();
        }

        let (data, tags) = read_tags(&path);
        assert_eq!(&data[..3], b"FLV");
        assert_eq!(tags.len(), 2);
        assert_eq!(&tags[0].data[..], b"first");
        assert_eq!(&tags[1].data[..], b"second");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_refuses_foreign_file() {
        let path = temp_path("foreign");
        std::fs::write(&path, b"#!/bin/sh\necho not a recording\n").unwrap();

        let err = FlvRecorder::open(&path).err().unwrap();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::InvalidData));
        // Left untouched
        assert_eq!(std::fs::read(&path).unwrap(), b"#!/bin/sh\necho not a recording\n");

        std::fs::write(&path, b"FLV").unwrap();
        assert!(FlvRecorder::open(&path).is_err());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_append_after_close() {
        let path = temp_path("closed");
        let recorder = FlvRecorder::open(&path).unwrap();
        recorder.close().unwrap();
        assert!(recorder.is_closed());
        assert!(matches!(
            recorder.append(FlvTagType::Audio, 0, Bytes::from_static(b"late")),
            Err(Error::RecorderClosed)
        ));
        // Closing twice is harmless
        recorder.close().unwrap();

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_concurrent_appends_stay_whole() {
        let path = temp_path("threads");
        let recorder = std::sync::Arc::new(FlvRecorder::open(&path).unwrap());

        let handles: Vec<_> = [FlvTagType::Audio, FlvTagType::Video]
            .into_iter()
            .map(|tag_type| {
                let recorder = recorder.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        recorder.append(tag_type, 10, Bytes::from(vec![tag_type.type_id(); 37])).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        recorder.close().unwrap();

        let (_, tags) = read_tags(&path);
        assert_eq!(tags.len(), 400);
        for tag in &tags {
            assert!(tag.data.iter().all(|b| *b == tag.tag_type.type_id()));
        }

        let _ = std::fs::remove_file(&path);
    }
}
