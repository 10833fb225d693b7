//! NDJSON writer (C1): append-or-replace, optionally-gzipped,
//! crash-atomic line-oriented file writes.
//!
//! Grounded in `octofhir-server`'s `operations/bulk/writer.rs` for the
//! tokio-fs/async-write shape, generalized with the append-vs-replace and
//! gzip-on-`.gz` semantics from `original_source/smart_fetch/ndjson.py`.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

#[derive(Debug, Error)]
pub enum NdjsonError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize resource: {0}")]
    Json(#[from] serde_json::Error),
}

fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

enum Sink {
    Plain(tokio::io::BufWriter<fs::File>),
    Gzip(GzEncoder<Vec<u8>>, fs::File),
}

/// Writes one JSON value per line, compact (no intra-line whitespace).
///
/// `append` opens the target directly, appending; `replace` buffers writes to
/// `<path>.tmp` and atomically renames over `path` on close, so a crash
/// mid-write leaves the prior contents (if any) untouched. Opening is lazy:
/// until the first `write`, no file — not even a zero-length one — exists.
pub struct NdjsonWriter {
    path: PathBuf,
    append: bool,
    compressed: bool,
    sink: Option<Sink>,
    lines_written: usize,
}

impl NdjsonWriter {
    pub fn new(path: impl Into<PathBuf>, append: bool) -> Self {
        let path = path.into();
        let compressed = is_compressed(&path);
        Self {
            path,
            append,
            compressed,
            sink: None,
            lines_written: 0,
        }
    }

    fn target_path(&self) -> PathBuf {
        if self.append {
            self.path.clone()
        } else {
            let mut tmp = self.path.clone().into_os_string();
            tmp.push(".tmp");
            PathBuf::from(tmp)
        }
    }

    async fn ensure_open(&mut self) -> Result<(), NdjsonError> {
        if self.sink.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| NdjsonError::Io { path: parent.to_path_buf(), source: e })?;
        }

        let target = self.target_path();
        let mut needs_newline_fixup = false;

        let file = if self.append && target.exists() {
            if !self.compressed {
                needs_newline_fixup = last_byte_is_not_newline(&target).await?;
            }
            fs::OpenOptions::new()
                .append(true)
                .open(&target)
                .await
                .map_err(|e| NdjsonError::Io { path: target.clone(), source: e })?
        } else {
            fs::File::create(&target)
                .await
                .map_err(|e| NdjsonError::Io { path: target.clone(), source: e })?
        };

        self.sink = Some(if self.compressed {
            Sink::Gzip(GzEncoder::new(Vec::new(), Compression::default()), file)
        } else {
            Sink::Plain(tokio::io::BufWriter::new(file))
        });

        if needs_newline_fixup {
            self.write_raw(b"\n").await?;
        }

        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), NdjsonError> {
        match self.sink.as_mut().expect("ensure_open called first") {
            Sink::Plain(w) => {
                w.write_all(bytes)
                    .await
                    .map_err(|e| NdjsonError::Io { path: self.path.clone(), source: e })?;
            }
            Sink::Gzip(enc, _) => {
                enc.write_all(bytes)
                    .map_err(|e| NdjsonError::Io { path: self.path.clone(), source: e })?;
            }
        }
        Ok(())
    }

    /// Writes one resource as a compact JSON line.
    pub async fn write(&mut self, value: &Value) -> Result<(), NdjsonError> {
        self.ensure_open().await?;
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.write_raw(&line).await?;
        self.lines_written += 1;
        Ok(())
    }

    pub fn lines_written(&self) -> usize {
        self.lines_written
    }

    /// Flushes, fsyncs, and (in replace mode) atomically renames the temp
    /// file into place. A no-op if `write` was never called.
    pub async fn close(mut self) -> Result<(), NdjsonError> {
        let Some(sink) = self.sink.take() else {
            return Ok(());
        };

        let mut file = match sink {
            Sink::Plain(mut w) => {
                w.flush()
                    .await
                    .map_err(|e| NdjsonError::Io { path: self.path.clone(), source: e })?;
                w.into_inner()
            }
            Sink::Gzip(enc, mut file) => {
                let bytes = enc
                    .finish()
                    .map_err(|e| NdjsonError::Io { path: self.path.clone(), source: e })?;
                file.write_all(&bytes)
                    .await
                    .map_err(|e| NdjsonError::Io { path: self.path.clone(), source: e })?;
                file
            }
        };

        file.sync_all()
            .await
            .map_err(|e| NdjsonError::Io { path: self.path.clone(), source: e })?;
        drop(file);

        if !self.append {
            let tmp = self.target_path();
            fs::rename(&tmp, &self.path)
                .await
                .map_err(|e| NdjsonError::Io { path: self.path.clone(), source: e })?;
        }

        Ok(())
    }
}

async fn last_byte_is_not_newline(path: &Path) -> Result<bool, NdjsonError> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|e| NdjsonError::Io { path: path.to_path_buf(), source: e })?;
    let len = file
        .metadata()
        .await
        .map_err(|e| NdjsonError::Io { path: path.to_path_buf(), source: e })?
        .len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))
        .await
        .map_err(|e| NdjsonError::Io { path: path.to_path_buf(), source: e })?;
    let mut buf = [0u8; 1];
    file.read_exact(&mut buf)
        .await
        .map_err(|e| NdjsonError::Io { path: path.to_path_buf(), source: e })?;
    Ok(buf[0] != b'\n')
}

/// Counts lines in a local (possibly gzipped) NDJSON file, scanning in 1 MiB
/// windows and crediting a final partial line with no trailing newline.
pub async fn read_local_line_count(path: &Path) -> Result<usize, NdjsonError> {
    let raw = fs::read(path)
        .await
        .map_err(|e| NdjsonError::Io { path: path.to_path_buf(), source: e })?;
    let bytes = if is_compressed(path) {
        use std::io::Read;
        let mut decoder = flate2::read::GzDecoder::new(&raw[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| NdjsonError::Io { path: path.to_path_buf(), source: e })?;
        out
    } else {
        raw
    };

    if bytes.is_empty() {
        return Ok(0);
    }

    let mut count = 0usize;
    for chunk in bytes.chunks(1024 * 1024) {
        count += chunk.iter().filter(|&&b| b == b'\n').count();
    }
    if *bytes.last().unwrap() != b'\n' {
        count += 1;
    }
    Ok(count)
}

/// Reads every line of a local (possibly gzipped) NDJSON file as a parsed
/// `Value`. Used by the hydration pipeline, whose inputs are always small
/// enough per-file to load wholesale rather than stream.
pub async fn read_values(path: &Path) -> Result<Vec<Value>, NdjsonError> {
    let raw = fs::read(path)
        .await
        .map_err(|e| NdjsonError::Io { path: path.to_path_buf(), source: e })?;
    let bytes = if is_compressed(path) {
        use std::io::Read;
        let mut decoder = flate2::read::GzDecoder::new(&raw[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| NdjsonError::Io { path: path.to_path_buf(), source: e })?;
        out
    } else {
        raw
    };

    bytes
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).map_err(NdjsonError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn lazy_open_leaves_no_file_if_unwritten() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Patient.ndjson");
        let writer = NdjsonWriter::new(&path, true);
        writer.close().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn replace_mode_is_atomic_via_tmp_rename() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Patient.ndjson");
        std::fs::write(&path, "old\n").unwrap();

        let mut writer = NdjsonWriter::new(&path, false);
        writer.write(&json!({"resourceType": "Patient", "id": "1"})).await.unwrap();
        assert!(!path.to_string_lossy().is_empty());
        writer.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "{\"id\":\"1\",\"resourceType\":\"Patient\"}\n");
        assert!(!dir.path().join("Patient.ndjson.tmp").exists());
    }

    #[tokio::test]
    async fn append_inserts_missing_trailing_newline_first() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Patient.ndjson");
        std::fs::write(&path, "{\"resourceType\":\"Patient\",\"id\":\"0\"}").unwrap();

        let mut writer = NdjsonWriter::new(&path, true);
        writer.write(&json!({"resourceType": "Patient", "id": "1"})).await.unwrap();
        writer.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"id\":\"1\""));
    }

    #[tokio::test]
    async fn line_count_handles_missing_trailing_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.ndjson");
        std::fs::write(&path, "a\nb\nc").unwrap();
        assert_eq!(read_local_line_count(&path).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn read_values_round_trips_written_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Patient.ndjson");
        let mut writer = NdjsonWriter::new(&path, true);
        writer.write(&json!({"resourceType": "Patient", "id": "1"})).await.unwrap();
        writer.write(&json!({"resourceType": "Patient", "id": "2"})).await.unwrap();
        writer.close().await.unwrap();

        let values = read_values(&path).await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["id"], "1");
    }

    #[tokio::test]
    async fn gzip_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Patient.ndjson.gz");
        let mut writer = NdjsonWriter::new(&path, false);
        writer.write(&json!({"resourceType": "Patient", "id": "1"})).await.unwrap();
        writer.write(&json!({"resourceType": "Patient", "id": "2"})).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(read_local_line_count(&path).await.unwrap(), 2);
    }
}
