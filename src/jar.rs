//! Jar rewriting.
//!
//! Archives at or below the stream threshold are mapped and their entries
//! transformed in parallel; larger ones are read and written one entry at a
//! time. Either way the output keeps entry order, names, compression method,
//! timestamps and directory entries.

use memmap2::Mmap;
use rayon::prelude::*;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::IoFailure;

/// What a transform decided for one file entry.
#[derive(Debug)]
pub struct EntryResult<T> {
    /// New content; `None` forwards the original bytes.
    pub replacement: Option<Vec<u8>>,
    pub detail: T,
}

impl<T> EntryResult<T> {
    pub fn keep(detail: T) -> Self {
        Self {
            replacement: None,
            detail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    InMemory,
    Streaming,
}

pub fn read_mode(size: u64, stream_threshold: u64) -> ReadMode {
    if size > stream_threshold {
        ReadMode::Streaming
    } else {
        ReadMode::InMemory
    }
}

struct RawEntry {
    name: String,
    is_dir: bool,
    data: Vec<u8>,
    compression: CompressionMethod,
    modified: DateTime,
    unix_mode: Option<u32>,
}

/// Runs a read operation, retrying it once on failure.
pub fn retry_read<T, E: fmt::Display>(
    what: &str,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, IoFailure> {
    match op() {
        Ok(v) => Ok(v),
        Err(first) => {
            tracing::debug!(artifact = what, error = %first, "read failed, retrying once");
            op().map_err(|e| IoFailure::read(format!("{what}: {e}")))
        }
    }
}

/// Copies `input` to `output`, passing every file entry through `transform`.
///
/// Returns the detail of each file entry, in archive order.
pub fn transform_jar<T, F>(
    input: &Path,
    output: &Path,
    stream_threshold: u64,
    transform: F,
) -> Result<Vec<(String, T)>, IoFailure>
where
    T: Send,
    F: Fn(&str, &[u8]) -> EntryResult<T> + Sync,
{
    let label = input.display().to_string();
    let size = retry_read(&label, || std::fs::metadata(input))?.len();

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(IoFailure::write)?;
    }
    let file = File::create(output)
        .map_err(|e| IoFailure::write(format!("{}: {e}", output.display())))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));

    let details = match read_mode(size, stream_threshold) {
        ReadMode::InMemory => transform_in_memory(input, &label, &mut writer, &transform)?,
        ReadMode::Streaming => transform_streaming(input, &label, &mut writer, &transform)?,
    };

    let mut inner = writer.finish().map_err(IoFailure::write)?;
    inner.flush().map_err(IoFailure::write)?;
    Ok(details)
}

fn transform_in_memory<W, T, F>(
    input: &Path,
    label: &str,
    writer: &mut ZipWriter<W>,
    transform: &F,
) -> Result<Vec<(String, T)>, IoFailure>
where
    W: Write + Seek,
    T: Send,
    F: Fn(&str, &[u8]) -> EntryResult<T> + Sync,
{
    let file = retry_read(label, || File::open(input))?;
    // SAFETY: The file is opened read-only and remains valid for the lifetime of the mmap.
    // The mmap is dropped before the file, ensuring memory safety.
    let mmap = retry_read(label, || unsafe { Mmap::map(&file) })?;
    let mut archive = retry_read(label, || ZipArchive::new(Cursor::new(&mmap[..])))?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        entries.push(retry_read(label, || read_entry(&mut archive, i))?);
    }

    let results: Vec<Option<EntryResult<T>>> = entries
        .par_iter()
        .map(|e| (!e.is_dir).then(|| transform(&e.name, &e.data)))
        .collect();

    let mut details = Vec::with_capacity(entries.len());
    for (entry, result) in entries.iter().zip(results) {
        match result {
            None => write_entry(writer, entry, None)?,
            Some(result) => {
                write_entry(writer, entry, result.replacement.as_deref())?;
                details.push((entry.name.clone(), result.detail));
            }
        }
    }
    Ok(details)
}

fn transform_streaming<W, T, F>(
    input: &Path,
    label: &str,
    writer: &mut ZipWriter<W>,
    transform: &F,
) -> Result<Vec<(String, T)>, IoFailure>
where
    W: Write + Seek,
    F: Fn(&str, &[u8]) -> EntryResult<T>,
{
    let file = retry_read(label, || File::open(input))?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .map_err(|e| IoFailure::read(format!("{label}: {e}")))?;

    let mut details = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = retry_read(label, || read_entry(&mut archive, i))?;
        if entry.is_dir {
            write_entry(writer, &entry, None)?;
            continue;
        }
        let result = transform(&entry.name, &entry.data);
        write_entry(writer, &entry, result.replacement.as_deref())?;
        details.push((entry.name, result.detail));
    }
    Ok(details)
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    index: usize,
) -> Result<RawEntry, ZipError> {
    let mut file = archive.by_index(index)?;
    let mut data = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
    file.read_to_end(&mut data)?;
    Ok(RawEntry {
        name: file.name().to_string(),
        is_dir: file.is_dir(),
        data,
        compression: file.compression(),
        modified: file.last_modified(),
        unix_mode: file.unix_mode(),
    })
}

fn write_entry<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    entry: &RawEntry,
    replacement: Option<&[u8]>,
) -> Result<(), IoFailure> {
    let method = match entry.compression {
        CompressionMethod::Stored => CompressionMethod::Stored,
        _ => CompressionMethod::Deflated,
    };
    let mut options = FileOptions::default()
        .compression_method(method)
        .last_modified_time(entry.modified);
    if let Some(mode) = entry.unix_mode {
        options = options.unix_permissions(mode);
    }

    if entry.is_dir {
        return writer
            .add_directory(entry.name.as_str(), options)
            .map_err(IoFailure::write);
    }
    writer
        .start_file(entry.name.as_str(), options)
        .map_err(IoFailure::write)?;
    writer
        .write_all(replacement.unwrap_or(&entry.data))
        .map_err(IoFailure::write)
}
