//! Filesystem store for uploaded source audio.
//!
//! Blobs live under `<root>/<c0>/<c1>/.../<id>` where `c0..` are the first
//! `nesting_depth` characters of the random id.

use chrono::TimeDelta;
use log::{debug, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::constants::generate_id;

#[derive(Debug, Clone)]
pub struct SourceStore {
    root: PathBuf,
    nesting_depth: usize,
    id_length: usize,
}

impl SourceStore {
    pub fn new(root: impl Into<PathBuf>, nesting_depth: usize, id_length: usize) -> Self {
        Self {
            root: root.into(),
            nesting_depth: nesting_depth.min(id_length),
            id_length,
        }
    }

    /// Location of a blob; the file may not exist
    pub fn path(&self, id: &str) -> PathBuf {
        let mut path = self.root.clone();
        for c in id.chars().take(self.nesting_depth) {
            path.push(c.to_string());
        }
        path.push(id);
        path
    }

    /// Store a new blob and return its id
    pub async fn put(&self, data: &[u8]) -> std::io::Result<String> {
        let id = generate_id(self.id_length);
        let path = self.path(&id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        debug!("Stored source {} ({} bytes)", id, data.len());
        Ok(id)
    }

    pub async fn delete(&self, id: &str) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Source {} already gone", id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Read the playable duration of an audio file.
///
/// Uses the frame count from the container when present, otherwise walks
/// every packet. Blocking; run it off the async workers.
pub fn read_duration(path: &Path) -> Result<TimeDelta, Box<dyn std::error::Error + Send + Sync>> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let hint = Hint::new();
    let format_opts = FormatOptions::default();
    let metadata_opts = MetadataOptions::default();
    let opened =
        symphonia::default::get_probe().format(&hint, mss, &format_opts, &metadata_opts)?;
    let mut format = opened.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
        .ok_or("No audio track found")?;
    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.ok_or("Unknown sample rate")?;

    let frames = match track.codec_params.n_frames {
        Some(n) => n,
        None => {
            let mut total = 0u64;
            loop {
                match format.next_packet() {
                    Ok(packet) if packet.track_id() == track_id => total += packet.dur,
                    Ok(_) => {}
                    Err(symphonia::core::errors::Error::IoError(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            total
        }
    };

    let micros = (frames as u128 * 1_000_000 / sample_rate as u128) as i64;
    if micros <= 0 {
        return Err("Audio has no playable frames".into());
    }
    Ok(TimeDelta::microseconds(micros))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal 16-bit PCM WAV
    fn wav_bytes(sample_rate: u32, channels: u16, frames: u32) -> Vec<u8> {
        let data_len = frames * channels as u32 * 2;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.resize(out.len() + data_len as usize, 0);
        out
    }

    #[test]
    fn test_path_is_nested_by_id_prefix() {
        let store = SourceStore::new("/srv/sources", 2, 16);
        assert_eq!(
            store.path("abcdef"),
            PathBuf::from("/srv/sources/a/b/abcdef")
        );
    }

    #[tokio::test]
    async fn test_put_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SourceStore::new(dir.path(), 2, 12);

        let id = store.put(b"payload").await.unwrap();
        assert_eq!(id.len(), 12);
        assert_eq!(std::fs::read(store.path(&id)).unwrap(), b"payload");

        store.delete(&id).await.unwrap();
        assert!(!store.path(&id).exists());
        // Second delete is a no-op
        store.delete(&id).await.unwrap();
    }

    #[test]
    fn test_reads_wav_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        std::fs::write(&path, wav_bytes(8000, 1, 12000)).unwrap();

        let duration = read_duration(&path).unwrap();
        assert_eq!(duration, TimeDelta::milliseconds(1500));
    }

    #[test]
    fn test_rejects_garbage_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"definitely not audio").unwrap();
        assert!(read_duration(&path).is_err());
    }
}
