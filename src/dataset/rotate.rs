// src/dataset/rotate.rs

//! Offline dataset maintenance: re-striping and content verification.
//!
//! These utilities hold no persistent state; they read an existing dataset
//! and either produce a fresh one or report on it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::ReadOptions;
use crate::error::{Result, StoreError};
use crate::io::DirectFile;
use crate::stream::list_numeric;

use super::DataSetReader;

/// Re-stripes the files of the dataset at `input_dir` into `n_stream`
/// output streams, shuffling each file's records along the way.
///
/// Input files are assigned to output streams round-robin; each is rewritten
/// with [`DirectFile::shuffle`], so the record multiset is preserved while
/// the order within every file is randomized. `n_stream == 0` keeps the
/// input's stream count.
pub fn rotate(
    input_dir: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    n_stream: usize,
) -> Result<()> {
    let input_dir = input_dir.as_ref();
    let output_dir = output_dir.as_ref();

    let stream_ids = list_numeric(input_dir, true)?;
    if stream_ids.is_empty() {
        return Err(StoreError::corrupt(
            input_dir,
            "dataset has no stream directories",
        ));
    }
    let n = if n_stream == 0 {
        stream_ids.len()
    } else {
        n_stream
    };

    // Round-robin assignment of input files to output streams.
    let mut jobs: Vec<Vec<PathBuf>> = vec![Vec::new(); n];
    let mut next = 0;
    for sid in &stream_ids {
        let stream_dir = input_dir.join(sid.to_string());
        for fid in list_numeric(&stream_dir, false)? {
            jobs[next].push(stream_dir.join(fid.to_string()));
            next = (next + 1) % n;
        }
    }

    std::fs::create_dir_all(output_dir)
        .map_err(|e| StoreError::io_with_source(output_dir, "failed to create output dataset", e))?;
    for (i, files) in jobs.iter().enumerate() {
        if files.is_empty() {
            // Fewer input files than requested streams; an empty stream
            // directory would make the output unreadable.
            continue;
        }
        let stream_dir = output_dir.join(i.to_string());
        std::fs::create_dir_all(&stream_dir).map_err(|e| {
            StoreError::io_with_source(&stream_dir, "failed to create output stream", e)
        })?;
        for (j, file) in files.iter().enumerate() {
            DirectFile::shuffle(file, stream_dir.join(j.to_string()))?;
        }
        info!(
            stream = i,
            files = files.len(),
            "rotated stream"
        );
    }
    Ok(())
}

/// Checks that two datasets hold the same multiset of record serials.
///
/// Serial counts from `path1` and `path2` must cancel exactly; any residue
/// is reported as corruption.
pub fn verify_content(path1: impl AsRef<Path>, path2: impl AsRef<Path>) -> Result<()> {
    let mut counts: HashMap<i32, i64> = HashMap::new();
    accumulate(path1.as_ref(), 1, &mut counts)?;
    accumulate(path2.as_ref(), -1, &mut counts)?;

    let mismatched = counts.values().filter(|&&v| v != 0).count();
    if mismatched != 0 {
        return Err(StoreError::corrupt(
            path2.as_ref(),
            format!("{mismatched} serials differ in multiplicity between the datasets"),
        ));
    }
    Ok(())
}

fn accumulate(dir: &Path, delta: i64, counts: &mut HashMap<i32, i64>) -> Result<()> {
    let mut reader = DataSetReader::open(dir, ReadOptions::default())?;
    loop {
        match reader.read() {
            Ok(record) => *counts.entry(record.meta.serial).or_default() += delta,
            Err(e) if e.is_end_of_stream() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Geometry, WriteOptions};
    use crate::dataset::DataSetWriter;
    use crate::format::{Meta, Record};
    use crate::io::set_direct_io;
    use tempfile::TempDir;

    fn write_dataset(dir: &Path, n: i32, n_stream: usize) {
        let geometry = Geometry {
            n_stream,
            file_size: 200_000,
            container_size: 10_240,
        };
        let mut writer =
            DataSetWriter::create(dir, geometry, WriteOptions::default()).unwrap();
        let image = vec![3u8; 200];
        for serial in 0..n {
            let rec = Record::new(Meta { label: -1, serial }, &image, b"meta");
            writer.write(&rec).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_rotate_preserves_content() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        write_dataset(&input, 2000, 3);

        rotate(&input, &output, 0).unwrap();
        verify_content(&input, &output).unwrap();
    }

    #[test]
    fn test_rotate_to_different_stream_count() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        write_dataset(&input, 2000, 4);

        rotate(&input, &output, 2).unwrap();
        verify_content(&input, &output).unwrap();
        assert_eq!(crate::dataset::ping(&output).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_verify_content_detects_divergence() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_dataset(&a, 500, 2);
        write_dataset(&b, 499, 2);

        assert!(verify_content(&a, &b).is_err());
    }

    #[test]
    fn test_rotate_missing_input_fails() {
        set_direct_io(false);
        let dir = TempDir::new().unwrap();
        assert!(rotate(dir.path().join("nope"), dir.path().join("out"), 0).is_err());
    }
}
