//! Content Fingerprinter - stable hash of one file's or directory's declared state
//!
//! Which parts of a file enter the hash is decided by a [`Sensitivity`]:
//! - the path, normalized per [`Normalizer`]
//! - size, and modification time only when explicitly requested
//! - streamed content, optionally with line endings normalized
//!
//! Deciding *which* files count (tree walking, filters) lives in
//! [`crate::schema`]; this module only fingerprints one entry at a time.

use std::fmt;
use std::fs::{self, File, Metadata};
use std::io::Read;
use std::path::{Component, Path};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::digest::{DigestAlgorithm, DigesterCache, MutableDigester};
use crate::error::FingerprintError;

/// Buffer size for streaming file content (8KB)
const BUFFER_SIZE: usize = 8192;

/// Files with a NUL byte in their first 8000 bytes are treated as binary
const BINARY_PROBE: usize = 8000;

/// Stable lowercase-hex content hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub(crate) fn from_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for display
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a file's path contributes to its fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Normalizer {
    /// Full path as declared (most conservative)
    #[default]
    AbsolutePath,
    /// Path relative to the property root
    RelativePath,
    /// File name only
    NameOnly,
    /// Path ignored entirely
    ContentOnly,
    /// Root entries lose their names; entry order is significant
    Classpath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirectorySensitivity {
    #[default]
    Default,
    IgnoreEmptyDirectories,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineEndingSensitivity {
    #[default]
    Default,
    /// CRLF and lone CR hash like LF in text files
    NormalizeLineEndings,
}

/// Full fingerprinting policy for one property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Sensitivity {
    pub normalizer: Normalizer,
    pub directories: DirectorySensitivity,
    pub line_endings: LineEndingSensitivity,
    /// Include modification times. Fingerprints stop being portable.
    pub timestamps: bool,
}

impl Sensitivity {
    pub fn new(normalizer: Normalizer) -> Self {
        Self {
            normalizer,
            ..Self::default()
        }
    }

    pub fn absolute() -> Self {
        Self::new(Normalizer::AbsolutePath)
    }

    pub fn relative() -> Self {
        Self::new(Normalizer::RelativePath)
    }

    pub fn content_only() -> Self {
        Self::new(Normalizer::ContentOnly)
    }

    pub fn normalize_line_endings(mut self) -> Self {
        self.line_endings = LineEndingSensitivity::NormalizeLineEndings;
        self
    }

    pub fn ignore_empty_directories(mut self) -> Self {
        self.directories = DirectorySensitivity::IgnoreEmptyDirectories;
        self
    }

    pub fn with_timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }
}

/// Fingerprinter with one digester cache per concurrent user
pub struct Fingerprinter {
    algorithm: DigestAlgorithm,
    idle: Mutex<Vec<DigesterCache>>,
}

impl Fingerprinter {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Borrow a digester cache for the calling worker; it is returned on drop
    pub fn lease(&self) -> DigesterLease<'_> {
        let cache = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .unwrap_or_default();
        DigesterLease {
            owner: self,
            cache: Some(cache),
        }
    }

    /// Fingerprint a single file
    pub fn fingerprint(
        &self,
        path: &Path,
        root: &Path,
        sensitivity: &Sensitivity,
    ) -> Result<Fingerprint, FingerprintError> {
        let mut lease = self.lease();
        fingerprint_file(lease.digester(), path, root, sensitivity)
    }

    /// Hash an arbitrary byte string with this fingerprinter's algorithm
    pub fn hash_bytes(&self, bytes: &[u8]) -> Fingerprint {
        let mut lease = self.lease();
        let digester = lease.digester();
        digester.update(bytes);
        Fingerprint(digester.finish_hex())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(DigestAlgorithm::default())
    }
}

/// A digester cache checked out of a [`Fingerprinter`]
pub struct DigesterLease<'a> {
    owner: &'a Fingerprinter,
    cache: Option<DigesterCache>,
}

impl DigesterLease<'_> {
    /// The fingerprinter's digester, freshly reset
    pub fn digester(&mut self) -> &mut MutableDigester {
        let algorithm = self.owner.algorithm;
        self.cache
            .get_or_insert_with(DigesterCache::new)
            .get_algorithm(algorithm)
    }
}

impl Drop for DigesterLease<'_> {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.take() {
            self.owner
                .idle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(cache);
        }
    }
}

/// Fingerprint one regular file
///
/// The file is stat'ed, opened, and re-stat'ed through the handle; any
/// disagreement (vanished, became a directory, size changed mid-read) is a
/// hard error.
pub fn fingerprint_file(
    digester: &mut MutableDigester,
    path: &Path,
    root: &Path,
    sensitivity: &Sensitivity,
) -> Result<Fingerprint, FingerprintError> {
    digester.reset();

    let metadata = fs::metadata(path).map_err(|e| FingerprintError::from_io(path, e))?;
    expect_kind(path, &metadata, "file")?;

    let mut file = File::open(path).map_err(|e| FingerprintError::from_io(path, e))?;
    let opened = file.metadata().map_err(|e| FingerprintError::from_io(path, e))?;
    expect_kind(path, &opened, "file")?;
    if opened.len() != metadata.len() {
        return Err(FingerprintError::ChangedWhileReading {
            path: path.to_path_buf(),
        });
    }

    digester.update_field(b"file");
    hash_path(digester, path, root, sensitivity.normalizer);
    if sensitivity.line_endings == LineEndingSensitivity::Default {
        digester.update(&opened.len().to_le_bytes());
    }
    if sensitivity.timestamps {
        digester.update(&mtime_nanos(&opened).to_le_bytes());
    }

    let read = stream_content(digester, &mut file, path, sensitivity.line_endings)?;
    if read != opened.len() {
        return Err(FingerprintError::ChangedWhileReading {
            path: path.to_path_buf(),
        });
    }

    Ok(Fingerprint(digester.finish_hex()))
}

/// Fingerprint a directory entry; `aggregate_size` is supplied by the tree walker
pub fn fingerprint_directory(
    digester: &mut MutableDigester,
    path: &Path,
    root: &Path,
    sensitivity: &Sensitivity,
    aggregate_size: u64,
) -> Result<Fingerprint, FingerprintError> {
    digester.reset();

    let metadata = fs::metadata(path).map_err(|e| FingerprintError::from_io(path, e))?;
    expect_kind(path, &metadata, "directory")?;

    digester.update_field(b"dir");
    hash_path(digester, path, root, sensitivity.normalizer);
    digester.update(&aggregate_size.to_le_bytes());
    if sensitivity.timestamps {
        digester.update(&mtime_nanos(&metadata).to_le_bytes());
    }

    Ok(Fingerprint(digester.finish_hex()))
}

/// Root-relative path with `/` separators; empty when `path == root`
pub fn normalized_relative(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();
    Some(parts.join("/"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn hash_path(digester: &mut MutableDigester, path: &Path, root: &Path, normalizer: Normalizer) {
    let normalized = match normalizer {
        Normalizer::AbsolutePath => path.to_string_lossy().into_owned(),
        Normalizer::RelativePath => match normalized_relative(path, root) {
            Some(rel) if !rel.is_empty() => rel,
            _ => file_name(path),
        },
        Normalizer::Classpath => match normalized_relative(path, root) {
            Some(rel) => rel,
            None => String::new(),
        },
        Normalizer::NameOnly => file_name(path),
        Normalizer::ContentOnly => String::new(),
    };
    digester.update_field(normalized.as_bytes());
}

fn expect_kind(path: &Path, metadata: &Metadata, expected: &'static str) -> Result<(), FingerprintError> {
    let found = if metadata.is_dir() {
        "directory"
    } else if metadata.is_file() {
        "file"
    } else {
        "special file"
    };
    if found == expected {
        Ok(())
    } else {
        Err(FingerprintError::TypeChanged {
            path: path.to_path_buf(),
            expected,
            found,
        })
    }
}

fn mtime_nanos(metadata: &Metadata) -> u128 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Stream file content into the digester, returning the raw byte count
fn stream_content(
    digester: &mut MutableDigester,
    file: &mut File,
    path: &Path,
    line_endings: LineEndingSensitivity,
) -> Result<u64, FingerprintError> {
    let mut buffer = [0u8; BUFFER_SIZE];
    let mut total: u64 = 0;
    let mut normalizer = match line_endings {
        LineEndingSensitivity::Default => None,
        LineEndingSensitivity::NormalizeLineEndings => Some(LineEndingNormalizer::default()),
    };
    let mut probed = false;

    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| FingerprintError::from_io(path, e))?;
        if read == 0 {
            break;
        }
        let chunk = &buffer[..read];

        if !probed {
            probed = true;
            let probe = &chunk[..chunk.len().min(BINARY_PROBE)];
            if probe.contains(&0) {
                normalizer = None;
            }
        }

        match normalizer.as_mut() {
            Some(n) => digester.update(&n.normalize(chunk)),
            None => digester.update(chunk),
        }
        total += read as u64;
    }

    Ok(total)
}

/// Rewrites CRLF and lone CR to LF, across chunk boundaries
#[derive(Default)]
struct LineEndingNormalizer {
    after_cr: bool,
}

impl LineEndingNormalizer {
    fn normalize(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len());
        for &byte in chunk {
            match byte {
                b'\r' => {
                    out.push(b'\n');
                    self.after_cr = true;
                }
                b'\n' if self.after_cr => {
                    self.after_cr = false;
                }
                _ => {
                    self.after_cr = false;
                    out.push(byte);
                }
            }
        }
        out
    }
}
