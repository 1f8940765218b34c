//! Partitioned record writer with adaptive streaming compression.
//!
//! Each partition path owns at most one output pipeline: either an open
//! raw file or a live XZ encoder, never both. High-traffic partitions
//! earn a streaming encoder under a soft memory budget (the encoder is
//! the dominant memory cost); everything else accumulates raw bytes
//! and is compressed in batch at rotation or finalize. Finalized
//! partitions publish exactly one `.xz` file into the upload tree.

pub mod encoder;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;

use self::encoder::CompressedFileWriter;

/// Writes between encoder reassignment passes.
const REPRIORITIZATION_INTERVAL: u64 = 1000;

/// Raw backlog a partition must accumulate before it qualifies for a
/// streaming encoder.
const COMPRESSION_THRESHOLD: u64 = 20 * 1024 * 1024;

const RAW_FILE_NAME: &str = "data.log";
const COMPRESSED_FILE_NAME: &str = "data.log.xz";

/// Resident encoder memory by preset, used to size the encoder pool
/// against the soft memory limit.
const PRESET_CONTEXT_SIZE: [u64; 10] = [
    3_145_728,
    9_437_184,
    17_825_792,
    33_554_432,
    50_331_648,
    98_566_144,
    98_566_144,
    195_035_136,
    387_973_120,
    706_740_224,
];

#[derive(Default)]
struct Partition {
    raw_file: Option<File>,
    compressor: Option<CompressedFileWriter>,
    /// All bytes ever written to this partition, compressed or not.
    uncompressed_size: u64,
    /// Bytes that exist only in the raw file.
    raw_only_size: u64,
    records_since_repri: u64,
    corrupted: bool,
}

pub struct RecordWriter {
    work_dir: PathBuf,
    upload_dir: PathBuf,
    max_uncompressed_size: u64,
    compression_preset: u32,
    /// Encoder pool size derived from the soft memory limit.
    max_contexts: usize,
    partitions: HashMap<String, Partition>,
    write_count: u64,
}

impl RecordWriter {
    pub fn new(
        work_dir: &Path,
        upload_dir: &Path,
        max_uncompressed_size: u64,
        soft_memory_limit: u64,
        compression_preset: u32,
    ) -> Self {
        let context_size = PRESET_CONTEXT_SIZE[compression_preset as usize];
        // one context is held back for batch compression at finalize
        let max_contexts = (soft_memory_limit / context_size).saturating_sub(1) as usize;

        RecordWriter {
            work_dir: work_dir.to_path_buf(),
            upload_dir: upload_dir.to_path_buf(),
            max_uncompressed_size,
            compression_preset,
            max_contexts,
            partitions: HashMap::new(),
            write_count: 0,
        }
    }

    /// Write one serialized record to a partition.
    ///
    /// Creates the partition on first use, rotates it out when it
    /// exceeds the size threshold, and periodically reassigns encoders.
    /// Returns `false` when the record could not be durably written.
    pub fn write(&mut self, partition: &str, bytes: &[u8]) -> bool {
        self.write_count += 1;
        let mut ok = true;
        let mut needs_rotation = false;

        let entry = self.partitions.entry(partition.to_string()).or_default();
        if entry.corrupted {
            ok = false;
        } else {
            match write_to_partition(&self.work_dir, partition, entry, bytes) {
                Ok(()) => {
                    needs_rotation = entry.uncompressed_size > self.max_uncompressed_size;
                }
                Err(e) => {
                    tracing::error!(partition, error = %e, "partition write failed");
                    entry.corrupted = true;
                    ok = false;
                }
            }
        }
        if needs_rotation {
            ok = self.rotate(partition);
        }

        if self.write_count % REPRIORITIZATION_INTERVAL == 0 {
            self.reprioritize();
        }
        ok
    }

    /// Finalize every non-corrupted partition. Returns `true` iff no
    /// partition is corrupted and every finalize succeeded.
    pub fn finalize(&mut self) -> bool {
        let mut success = true;
        let keys: Vec<String> = self.partitions.keys().cloned().collect();

        for key in keys {
            let entry = match self.partitions.get_mut(&key) {
                Some(p) => p,
                None => continue,
            };
            if entry.corrupted {
                success = false;
                continue;
            }
            match finalize_partition(
                &self.work_dir,
                &self.upload_dir,
                self.compression_preset,
                &key,
                entry,
            ) {
                Ok(()) => {
                    self.partitions.remove(&key);
                }
                Err(e) => {
                    tracing::error!(partition = %key, error = %e, "partition finalize failed");
                    entry.corrupted = true;
                    success = false;
                }
            }
        }
        success
    }

    /// Finalize one partition inline after it outgrew the rotation
    /// threshold.
    fn rotate(&mut self, partition: &str) -> bool {
        let entry = match self.partitions.get_mut(partition) {
            Some(p) => p,
            None => return true,
        };
        match finalize_partition(
            &self.work_dir,
            &self.upload_dir,
            self.compression_preset,
            partition,
            entry,
        ) {
            Ok(()) => {
                self.partitions.remove(partition);
                true
            }
            Err(e) => {
                tracing::error!(partition, error = %e, "partition rotation failed");
                entry.corrupted = true;
                false
            }
        }
    }

    /// Reassign streaming encoders to the most active partitions.
    ///
    /// Candidates are partitions that hold an encoder or have enough
    /// raw backlog to deserve one. They are ranked by write activity
    /// since the previous pass, with current encoder holders winning
    /// ties so the pass is idempotent; the top of the ranking keeps or
    /// gains an encoder up to the memory budget, the rest are detached
    /// and fall back to raw accumulation.
    fn reprioritize(&mut self) {
        let mut candidates: Vec<(String, u64, bool)> = self
            .partitions
            .iter()
            .filter(|(_, p)| {
                !p.corrupted
                    && (p.compressor.is_some() || p.raw_only_size > COMPRESSION_THRESHOLD)
            })
            .map(|(key, p)| (key.clone(), p.records_since_repri, p.compressor.is_some()))
            .collect();

        candidates.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then(b.2.cmp(&a.2))
                .then(a.0.cmp(&b.0))
        });

        // detach first so the budget is respected before new encoders
        // are created
        for (key, _, _) in candidates.iter().skip(self.max_contexts) {
            if let Some(p) = self.partitions.get_mut(key) {
                if p.compressor.is_some() {
                    if let Err(e) = detach_compressor(p) {
                        tracing::error!(partition = %key, error = %e, "encoder detach failed");
                        p.corrupted = true;
                    }
                }
            }
        }
        for (key, _, _) in candidates.iter().take(self.max_contexts) {
            if let Some(p) = self.partitions.get_mut(key) {
                if !p.corrupted && p.compressor.is_none() {
                    if let Err(e) =
                        attach_compressor(&self.work_dir, self.compression_preset, key, p)
                    {
                        tracing::error!(partition = %key, error = %e, "encoder attach failed");
                        p.corrupted = true;
                    }
                }
            }
        }

        for p in self.partitions.values_mut() {
            p.records_since_repri = 0;
        }
    }

    #[cfg(test)]
    fn contains(&self, partition: &str) -> bool {
        self.partitions.contains_key(partition)
    }

    #[cfg(test)]
    fn has_compressor(&self, partition: &str) -> bool {
        self.partitions
            .get(partition)
            .map_or(false, |p| p.compressor.is_some())
    }

    #[cfg(test)]
    fn reprioritize_now(&mut self) {
        self.reprioritize();
    }
}

fn write_to_partition(
    work_dir: &Path,
    key: &str,
    p: &mut Partition,
    bytes: &[u8],
) -> Result<()> {
    if let Some(compressor) = p.compressor.as_mut() {
        compressor.write(bytes)?;
    } else {
        if p.raw_file.is_none() {
            let dir = work_dir.join(key);
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating partition dir {}", dir.display()))?;
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(dir.join(RAW_FILE_NAME))?;
            p.raw_file = Some(file);
        }
        if let Some(file) = p.raw_file.as_mut() {
            file.write_all(bytes)?;
            p.raw_only_size += bytes.len() as u64;
        }
    }

    p.uncompressed_size += bytes.len() as u64;
    p.records_since_repri += 1;
    Ok(())
}

/// Open the compressed file in append mode, start an encoder on it, and
/// stream any existing raw backlog through before removing the raw file.
fn attach_compressor(work_dir: &Path, preset: u32, key: &str, p: &mut Partition) -> Result<()> {
    let dir = work_dir.join(key);
    let compressed = OpenOptions::new()
        .append(true)
        .create(true)
        .open(dir.join(COMPRESSED_FILE_NAME))
        .with_context(|| format!("opening compressed file in {}", dir.display()))?;
    let mut encoder = CompressedFileWriter::new(compressed, preset)?;

    // close the write handle before re-reading the raw file
    drop(p.raw_file.take());

    let raw_path = dir.join(RAW_FILE_NAME);
    if raw_path.exists() {
        let mut raw = File::open(&raw_path)?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = raw.read(&mut buf)?;
            if n == 0 {
                break;
            }
            encoder.write(&buf[..n])?;
        }
        fs::remove_file(&raw_path)?;
    }

    p.compressor = Some(encoder);
    p.raw_only_size = 0;
    Ok(())
}

/// Finalize the encoder, flushing its deferred output. The partition
/// falls back to raw accumulation; a later attach appends a new XZ
/// stream to the same file.
fn detach_compressor(p: &mut Partition) -> Result<()> {
    if let Some(compressor) = p.compressor.take() {
        compressor.finalize()?;
    }
    Ok(())
}

fn finalize_partition(
    work_dir: &Path,
    upload_dir: &Path,
    preset: u32,
    key: &str,
    p: &mut Partition,
) -> Result<()> {
    let dir = work_dir.join(key);
    let raw_path = dir.join(RAW_FILE_NAME);
    let compressed_path = dir.join(COMPRESSED_FILE_NAME);

    if p.compressor.is_some() {
        detach_compressor(p)?;
    } else if p.raw_file.is_some() || raw_path.exists() {
        // batch-compress the accumulated raw data
        attach_compressor(work_dir, preset, key, p)?;
        detach_compressor(p)?;
    }

    if !compressed_path.exists() {
        // nothing was ever written
        return Ok(());
    }

    let target_dir = upload_dir.join(key);
    fs::create_dir_all(&target_dir)
        .with_context(|| format!("creating upload dir {}", target_dir.display()))?;
    let target = target_dir.join(format!("data.{}.log.xz", Uuid::new_v4().simple()));
    fs::rename(&compressed_path, &target)
        .with_context(|| format!("publishing {}", target.display()))?;

    // tidy the now-empty partition directories
    let mut cursor = dir.as_path();
    while cursor.starts_with(work_dir) && cursor != work_dir {
        if fs::remove_dir(cursor).is_err() {
            break;
        }
        cursor = match cursor.parent() {
            Some(parent) => parent,
            None => break,
        };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xz2::read::XzDecoder;

    fn decode_upload(upload_dir: &Path, partition: &str) -> Vec<Vec<u8>> {
        let dir = upload_dir.join(partition);
        let mut out = Vec::new();
        let mut entries: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        entries.sort();
        for path in entries {
            assert!(path.file_name().unwrap().to_str().unwrap().ends_with(".log.xz"));
            let mut decoded = Vec::new();
            XzDecoder::new_multi_decoder(File::open(&path).unwrap())
                .read_to_end(&mut decoded)
                .unwrap();
            out.push(decoded);
        }
        out
    }

    fn work_tree_is_empty(work_dir: &Path) -> bool {
        fn visit(dir: &Path) -> bool {
            match fs::read_dir(dir) {
                Ok(entries) => entries.flatten().all(|e| {
                    let path = e.path();
                    path.is_dir() && visit(&path)
                }),
                Err(_) => true,
            }
        }
        visit(work_dir)
    }

    #[test]
    fn test_write_finalize_roundtrip() {
        let work = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        let mut writer = RecordWriter::new(work.path(), upload.path(), 1_048_576, 1000, 0);

        let payload = b"431ab5c3-2712-4ab7-a4b6-e9b61f3a1f30\t{\"ver\":2}\n";
        assert!(writer.write("output", payload));
        assert!(writer.finalize());

        assert!(work_tree_is_empty(work.path()));
        let decoded = decode_upload(upload.path(), "output");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], payload);
        assert!(!writer.contains("output"));
    }

    #[test]
    fn test_nested_partition_path() {
        let work = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        let mut writer = RecordWriter::new(work.path(), upload.path(), u64::MAX, 1000, 0);

        let partition = "idle_daily/Firefox/release/23.0.1/20130814063812.1";
        assert!(writer.write(partition, b"record-a\n"));
        assert!(writer.write(partition, b"record-b\n"));
        assert!(writer.finalize());

        let decoded = decode_upload(upload.path(), partition);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], b"record-a\nrecord-b\n");
        assert!(work_tree_is_empty(work.path()));
    }

    #[test]
    fn test_rotation_is_strictly_greater() {
        let work = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        let max = 1_048_576u64;
        let mut writer = RecordWriter::new(work.path(), upload.path(), max, 1000, 0);

        // exactly the threshold: no rotation
        let exact = vec![b'x'; max as usize];
        assert!(writer.write("x", &exact));
        assert!(writer.contains("x"));
        assert!(fs::read_dir(upload.path().join("x")).is_err());

        // one more byte pushes it over: rotated inline
        assert!(writer.write("x", b"y"));
        assert!(!writer.contains("x"));
        let decoded = decode_upload(upload.path(), "x");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].len(), max as usize + 1);
    }

    #[test]
    fn test_oversized_single_record_rotates() {
        let work = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        let mut writer = RecordWriter::new(work.path(), upload.path(), 1_048_576, 1000, 0);

        let record = vec![b'r'; 1_100_000];
        assert!(writer.write("X", &record));
        assert!(!writer.contains("X"));
        let decoded = decode_upload(upload.path(), "X");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], record);
    }

    #[test]
    fn test_reprioritization_attaches_by_activity_and_is_idempotent() {
        let work = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        // budget: two preset-0 contexts, minus the reserved one → 1
        let soft_limit = PRESET_CONTEXT_SIZE[0] * 2;
        let mut writer = RecordWriter::new(work.path(), upload.path(), u64::MAX, soft_limit, 0);

        let chunk = vec![b'c'; 1024 * 1024];
        for _ in 0..25 {
            assert!(writer.write("busy", &chunk));
        }
        for _ in 0..22 {
            assert!(writer.write("quiet", &chunk));
        }

        writer.reprioritize_now();
        assert!(writer.has_compressor("busy"));
        assert!(!writer.has_compressor("quiet"));

        // no intervening writes: the same encoder set must survive
        writer.reprioritize_now();
        assert!(writer.has_compressor("busy"));
        assert!(!writer.has_compressor("quiet"));

        // everything still finalizes and round-trips
        assert!(writer.finalize());
        assert_eq!(decode_upload(upload.path(), "busy")[0].len(), 25 * chunk.len());
        assert_eq!(decode_upload(upload.path(), "quiet")[0].len(), 22 * chunk.len());
        assert!(work_tree_is_empty(work.path()));
    }

    #[test]
    fn test_zero_budget_detaches_nothing_attached() {
        let work = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        // soft limit below one context: budget is zero encoders
        let mut writer =
            RecordWriter::new(work.path(), upload.path(), u64::MAX, 1_000_000, 0);

        let chunk = vec![b'c'; 1024 * 1024];
        for _ in 0..25 {
            assert!(writer.write("p", &chunk));
        }
        writer.reprioritize_now();
        assert!(!writer.has_compressor("p"));
        assert!(writer.finalize());
    }

    #[test]
    fn test_corrupted_partition_is_never_reentered() {
        let work = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        let mut writer = RecordWriter::new(work.path(), upload.path(), u64::MAX, 1000, 0);

        // a plain file where the partition directory should go forces
        // the first write to fail
        fs::write(work.path().join("blocked"), b"in the way").unwrap();

        assert!(!writer.write("blocked", b"data"));
        assert!(!writer.write("blocked", b"data"));
        assert!(writer.contains("blocked"));

        // corrupted partitions fail finalize but don't block others
        assert!(writer.write("fine", b"data"));
        assert!(!writer.finalize());
        assert_eq!(decode_upload(upload.path(), "fine")[0], b"data");
        assert!(writer.contains("blocked"));
    }

    #[test]
    fn test_finalize_empty_writer() {
        let work = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        let mut writer = RecordWriter::new(work.path(), upload.path(), 1000, 1000, 0);
        assert!(writer.finalize());
    }

    #[test]
    fn test_streamed_then_raw_tail_roundtrips() {
        let work = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        let soft_limit = PRESET_CONTEXT_SIZE[0] * 2;
        let mut writer = RecordWriter::new(work.path(), upload.path(), u64::MAX, soft_limit, 0);

        let chunk = vec![b'a'; 1024 * 1024];
        for _ in 0..21 {
            assert!(writer.write("p", &chunk));
        }
        writer.reprioritize_now();
        assert!(writer.has_compressor("p"));

        // more data lands in the encoder while a competitor builds up
        // a bigger backlog with more activity
        assert!(writer.write("p", b"streamed-tail"));
        for _ in 0..21 {
            assert!(writer.write("q", &chunk));
        }

        // the single budgeted encoder moves to the busier partition;
        // p's tail falls back to a fresh raw file
        writer.reprioritize_now();
        assert!(!writer.has_compressor("p"));
        assert!(writer.has_compressor("q"));
        assert!(writer.write("p", b"raw-tail"));

        assert!(writer.finalize());
        let decoded = decode_upload(upload.path(), "p");
        assert_eq!(decoded.len(), 1);
        let mut expected: Vec<u8> = Vec::new();
        for _ in 0..21 {
            expected.extend_from_slice(&chunk);
        }
        expected.extend_from_slice(b"streamed-tail");
        expected.extend_from_slice(b"raw-tail");
        assert_eq!(decoded[0], expected);
    }
}
