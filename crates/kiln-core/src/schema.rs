//! Work Schema - declared properties of a unit of work
//!
//! A schema is a closed set of property variants (scalar, file, nested)
//! plus declared outputs. It is built once and never mutated; properties
//! are kept sorted by name so declaration order never affects identity.
//!
//! This module also owns the "which files count" policy: walking file
//! trees, applying include/exclude globs, and deciding what an empty or
//! missing input means. Fingerprinting each individual entry is delegated
//! to [`crate::hasher`].

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::digest::{DigestAlgorithm, DigesterCache};
use crate::error::{FingerprintError, NodeFailure};
use crate::hasher::{
    fingerprint_directory, fingerprint_file, normalized_relative, DirectorySensitivity, Fingerprint,
    Fingerprinter, Normalizer, Sensitivity,
};

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// How a property's value participates in up-to-date checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyBehavior {
    /// Must exist; a missing root fails the node
    #[default]
    Required,
    /// May be absent
    Optional,
    /// When every primary input is empty the node is skipped as "no source"
    PrimaryInput,
    /// Per-file changes are reported to the action on re-execution
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    /// Exactly one regular file
    File,
    /// Any mix of files and directory trees
    Files,
    /// Exactly one directory tree
    Directory,
}

/// A file-valued input property
#[derive(Debug, Clone)]
pub struct FileInput {
    name: String,
    kind: FileKind,
    roots: Vec<PathBuf>,
    sensitivity: Sensitivity,
    behavior: PropertyBehavior,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl FileInput {
    fn new(name: impl Into<String>, kind: FileKind, roots: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            roots,
            sensitivity: Sensitivity::absolute(),
            behavior: PropertyBehavior::default(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name, FileKind::File, vec![path.into()])
    }

    pub fn files<P: Into<PathBuf>>(name: impl Into<String>, paths: impl IntoIterator<Item = P>) -> Self {
        Self::new(name, FileKind::Files, paths.into_iter().map(Into::into).collect())
    }

    pub fn directory(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name, FileKind::Directory, vec![path.into()])
    }

    pub fn sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn normalizer(mut self, normalizer: Normalizer) -> Self {
        self.sensitivity.normalizer = normalizer;
        self
    }

    pub fn behavior(mut self, behavior: PropertyBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn normalize_line_endings(mut self) -> Self {
        self.sensitivity = self.sensitivity.normalize_line_endings();
        self
    }

    pub fn ignore_empty_directories(mut self) -> Self {
        self.sensitivity = self.sensitivity.ignore_empty_directories();
        self
    }

    pub fn with_timestamps(mut self) -> Self {
        self.sensitivity = self.sensitivity.with_timestamps();
        self
    }

    /// Only count walked files whose root-relative path matches `pattern`
    pub fn include(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.include.push(Pattern::new(pattern)?);
        Ok(self)
    }

    /// Never count walked entries whose root-relative path matches `pattern`
    pub fn exclude(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.exclude.push(Pattern::new(pattern)?);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn get_sensitivity(&self) -> &Sensitivity {
        &self.sensitivity
    }

    pub fn get_behavior(&self) -> PropertyBehavior {
        self.behavior
    }

    fn counts_file(&self, relative: &str) -> bool {
        (self.include.is_empty() || self.include.iter().any(|p| p.matches_with(relative, GLOB_OPTIONS)))
            && !self.exclude.iter().any(|p| p.matches_with(relative, GLOB_OPTIONS))
    }

    fn counts_directory(&self, relative: &str) -> bool {
        // With include patterns only matching files count
        self.include.is_empty() && !self.exclude.iter().any(|p| p.matches_with(relative, GLOB_OPTIONS))
    }
}

/// A plain value input (compiler flags, versions, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarInput {
    pub name: String,
    pub value: serde_json::Value,
}

/// A sub-object whose own properties are inputs, named `parent.child`
#[derive(Debug, Clone)]
pub struct NestedInput {
    pub name: String,
    pub schema: WorkSchema,
}

#[derive(Debug, Clone)]
pub enum Property {
    Scalar(ScalarInput),
    File(FileInput),
    Nested(NestedInput),
}

impl Property {
    pub fn name(&self) -> &str {
        match self {
            Property::Scalar(p) => &p.name,
            Property::File(p) => &p.name,
            Property::Nested(p) => &p.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputKind {
    File,
    Directory,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::File => "file",
            OutputKind::Directory => "directory",
        }
    }
}

/// A declared output location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputProperty {
    pub name: String,
    pub path: PathBuf,
    pub kind: OutputKind,
}

impl OutputProperty {
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: OutputKind::File,
        }
    }

    pub fn directory(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: OutputKind::Directory,
        }
    }
}

/// Immutable property declarations of one work node
#[derive(Debug, Clone, Default)]
pub struct WorkSchema {
    properties: Vec<Property>,
    outputs: Vec<OutputProperty>,
    destroys: Vec<PathBuf>,
    untracked: bool,
}

impl WorkSchema {
    pub fn builder() -> WorkSchemaBuilder {
        WorkSchemaBuilder::default()
    }

    /// All input properties, sorted by name
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn scalars(&self) -> impl Iterator<Item = &ScalarInput> {
        self.properties.iter().filter_map(|p| match p {
            Property::Scalar(s) => Some(s),
            _ => None,
        })
    }

    pub fn files(&self) -> impl Iterator<Item = &FileInput> {
        self.properties.iter().filter_map(|p| match p {
            Property::File(f) => Some(f),
            _ => None,
        })
    }

    pub fn nested(&self) -> impl Iterator<Item = &NestedInput> {
        self.properties.iter().filter_map(|p| match p {
            Property::Nested(n) => Some(n),
            _ => None,
        })
    }

    /// Declared outputs, sorted by name
    pub fn outputs(&self) -> &[OutputProperty] {
        &self.outputs
    }

    /// Paths this node deletes
    pub fn destroys(&self) -> &[PathBuf] {
        &self.destroys
    }

    pub fn is_untracked(&self) -> bool {
        self.untracked
    }

    /// Every file input root, including nested ones
    pub fn input_roots(&self) -> Vec<&Path> {
        let mut roots = Vec::new();
        for property in &self.properties {
            match property {
                Property::File(f) => roots.extend(f.roots.iter().map(PathBuf::as_path)),
                Property::Nested(n) => roots.extend(n.schema.input_roots()),
                Property::Scalar(_) => {}
            }
        }
        roots
    }

    /// Fingerprint every input property under its declared sensitivity
    pub fn snapshot_inputs(&self, fingerprinter: &Fingerprinter) -> Result<InputSnapshot, NodeFailure> {
        let mut snapshot = InputSnapshot::default();
        self.snapshot_into(fingerprinter, "", &mut snapshot)?;
        Ok(snapshot)
    }

    fn snapshot_into(
        &self,
        fingerprinter: &Fingerprinter,
        prefix: &str,
        snapshot: &mut InputSnapshot,
    ) -> Result<(), NodeFailure> {
        for property in &self.properties {
            let name = format!("{}{}", prefix, property.name());
            match property {
                Property::Scalar(scalar) => {
                    let mut lease = fingerprinter.lease();
                    let digester = lease.digester();
                    digester.update_field(b"scalar");
                    digester.update_field(scalar.value.to_string().as_bytes());
                    let fingerprint = Fingerprint::from_hex(digester.finish_hex());
                    snapshot.properties.insert(
                        name,
                        PropertySnapshot {
                            fingerprint,
                            behavior: PropertyBehavior::Required,
                            empty: false,
                            files: None,
                        },
                    );
                }
                Property::File(file) => {
                    let property = snapshot_file_input(fingerprinter, &name, file)?;
                    snapshot.properties.insert(name, property);
                }
                Property::Nested(nested) => {
                    nested
                        .schema
                        .snapshot_into(fingerprinter, &format!("{}.", name), snapshot)?;
                }
            }
        }
        Ok(())
    }

    /// Fingerprint every declared output as it currently exists on disk
    pub fn snapshot_outputs(
        &self,
        fingerprinter: &Fingerprinter,
    ) -> Result<BTreeMap<String, OutputSnapshot>, NodeFailure> {
        let mut outputs = BTreeMap::new();
        for output in &self.outputs {
            outputs.insert(output.name.clone(), snapshot_output(fingerprinter, output)?);
        }
        Ok(outputs)
    }
}

/// Accumulates declarations; [`WorkSchemaBuilder::build`] freezes them
#[derive(Debug, Default)]
pub struct WorkSchemaBuilder {
    properties: Vec<Property>,
    outputs: Vec<OutputProperty>,
    destroys: Vec<PathBuf>,
    untracked: bool,
}

impl WorkSchemaBuilder {
    pub fn scalar(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.push(Property::Scalar(ScalarInput {
            name: name.into(),
            value: value.into(),
        }));
        self
    }

    pub fn file(mut self, input: FileInput) -> Self {
        self.properties.push(Property::File(input));
        self
    }

    pub fn nested(mut self, name: impl Into<String>, schema: WorkSchema) -> Self {
        self.properties.push(Property::Nested(NestedInput {
            name: name.into(),
            schema,
        }));
        self
    }

    pub fn output(mut self, output: OutputProperty) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn destroys(mut self, path: impl Into<PathBuf>) -> Self {
        self.destroys.push(path.into());
        self
    }

    /// Always execute; never record history or use the build cache
    pub fn untracked(mut self) -> Self {
        self.untracked = true;
        self
    }

    pub fn build(self) -> WorkSchema {
        // Later declarations of a name replace earlier ones
        let mut properties = BTreeMap::new();
        for mut property in self.properties {
            if let Property::File(file) = &mut property {
                if file.kind == FileKind::Directory {
                    file.sensitivity.directories = DirectorySensitivity::IgnoreEmptyDirectories;
                }
            }
            properties.insert(property.name().to_string(), property);
        }

        let mut outputs = BTreeMap::new();
        for output in self.outputs {
            outputs.insert(output.name.clone(), output);
        }

        let mut destroys = self.destroys;
        destroys.sort();
        destroys.dedup();

        WorkSchema {
            properties: properties.into_values().collect(),
            outputs: outputs.into_values().collect(),
            destroys,
            untracked: self.untracked,
        }
    }
}

/// Fingerprint of one input property
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySnapshot {
    pub fingerprint: Fingerprint,
    pub behavior: PropertyBehavior,
    /// No regular files were found
    pub empty: bool,
    /// Per-file fingerprints, kept only for incremental properties
    pub files: Option<BTreeMap<String, Fingerprint>>,
}

/// Fingerprints of all input properties of one node, keyed by property name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSnapshot {
    properties: BTreeMap<String, PropertySnapshot>,
}

impl InputSnapshot {
    pub fn properties(&self) -> &BTreeMap<String, PropertySnapshot> {
        &self.properties
    }

    pub fn get(&self, name: &str) -> Option<&PropertySnapshot> {
        self.properties.get(name)
    }

    /// At least one primary input is declared and all of them are empty
    pub fn has_no_source(&self) -> bool {
        let mut primary = self
            .properties
            .values()
            .filter(|p| p.behavior == PropertyBehavior::PrimaryInput)
            .peekable();
        primary.peek().is_some() && primary.all(|p| p.empty)
    }

    /// Per-file fingerprints of every incremental property
    pub fn incremental_files(&self) -> BTreeMap<String, BTreeMap<String, Fingerprint>> {
        self.properties
            .iter()
            .filter_map(|(name, p)| p.files.clone().map(|files| (name.clone(), files)))
            .collect()
    }
}

/// One file of a snapshotted output, relative to the output location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub relative_path: String,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSnapshot {
    pub kind: OutputKind,
    pub fingerprint: Fingerprint,
    /// Empty when the output does not exist
    pub files: Vec<OutputFile>,
}

enum EntryKind {
    File,
    Directory { aggregate_size: u64 },
}

struct Entry {
    path: PathBuf,
    root: PathBuf,
    relative: String,
    kind: EntryKind,
}

fn kind_name(metadata: &fs::Metadata) -> &'static str {
    if metadata.is_dir() {
        "directory"
    } else if metadata.is_file() {
        "file"
    } else {
        "special file"
    }
}

fn snapshot_file_input(
    fingerprinter: &Fingerprinter,
    name: &str,
    input: &FileInput,
) -> Result<PropertySnapshot, NodeFailure> {
    let mut entries = Vec::new();
    let mut absent = Vec::new();

    for (index, root) in input.roots.iter().enumerate() {
        let metadata = match fs::metadata(root) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match input.behavior {
                    PropertyBehavior::Required | PropertyBehavior::Incremental => {
                        return Err(NodeFailure::MissingInput {
                            property: name.to_string(),
                            path: root.clone(),
                        });
                    }
                    PropertyBehavior::Optional | PropertyBehavior::PrimaryInput => {
                        absent.push(index);
                        continue;
                    }
                }
            }
            Err(e) => return Err(FingerprintError::from_io(root, e).into()),
        };

        let expected = match input.kind {
            FileKind::File => Some("file"),
            FileKind::Directory => Some("directory"),
            FileKind::Files => None,
        };
        if let Some(expected) = expected {
            let found = kind_name(&metadata);
            if found != expected {
                return Err(FingerprintError::TypeChanged {
                    path: root.clone(),
                    expected,
                    found,
                }
                .into());
            }
        }

        if metadata.is_dir() {
            walk_tree(root, input, &mut entries)?;
        } else {
            let parent = root.parent().map(Path::to_path_buf).unwrap_or_default();
            entries.push(Entry {
                path: root.clone(),
                relative: normalized_relative(root, &parent).unwrap_or_default(),
                root: parent,
                kind: EntryKind::File,
            });
        }
    }

    let sensitivity = input.sensitivity;
    let fingerprints = fingerprint_entries(fingerprinter.algorithm(), &entries, &sensitivity)?;
    let empty = !entries.iter().any(|e| matches!(e.kind, EntryKind::File));

    let files = (input.behavior == PropertyBehavior::Incremental).then(|| {
        entries
            .iter()
            .zip(&fingerprints)
            .filter(|(e, _)| matches!(e.kind, EntryKind::File))
            .map(|(e, fp)| (e.path.to_string_lossy().into_owned(), fp.clone()))
            .collect()
    });

    // Classpath-like properties are order sensitive
    let mut ordered = fingerprints;
    if sensitivity.normalizer != Normalizer::Classpath {
        ordered.sort();
    }

    let mut lease = fingerprinter.lease();
    let digester = lease.digester();
    digester.update_field(b"file-property");
    digester.update(&(ordered.len() as u64).to_le_bytes());
    for fingerprint in &ordered {
        digester.update_field(fingerprint.as_str().as_bytes());
    }
    for index in absent {
        digester.update_field(b"absent");
        digester.update(&(index as u64).to_le_bytes());
    }

    Ok(PropertySnapshot {
        fingerprint: Fingerprint::from_hex(digester.finish_hex()),
        behavior: input.behavior,
        empty,
        files,
    })
}

/// Collect the counted entries of one directory root, sorted by path
fn walk_tree(root: &Path, input: &FileInput, entries: &mut Vec<Entry>) -> Result<(), NodeFailure> {
    let track_directories = input.sensitivity.directories == DirectorySensitivity::Default;
    let mut files = Vec::new();
    let mut directories = Vec::new();

    // Symlinks count as their targets; link loops surface as walk errors
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            FingerprintError::from_io(path, io::Error::from(e))
        })?;
        let path = entry.path();
        let relative = normalized_relative(path, root).unwrap_or_default();

        if entry.file_type().is_dir() {
            if track_directories && (relative.is_empty() || input.counts_directory(&relative)) {
                directories.push((path.to_path_buf(), relative));
            }
        } else if input.counts_file(&relative) {
            let size = entry
                .metadata()
                .map_err(|e| {
                    FingerprintError::from_io(path, io::Error::from(e))
                })?
                .len();
            files.push((path.to_path_buf(), relative, size));
        }
    }

    let mut sizes: HashMap<&Path, u64> = HashMap::new();
    for (path, _, size) in &files {
        for ancestor in path.ancestors().skip(1) {
            *sizes.entry(ancestor).or_default() += size;
            if ancestor == root {
                break;
            }
        }
    }

    let mut walked: Vec<Entry> = directories
        .iter()
        .map(|(path, relative)| Entry {
            path: path.clone(),
            root: root.to_path_buf(),
            relative: relative.clone(),
            kind: EntryKind::Directory {
                aggregate_size: sizes.get(path.as_path()).copied().unwrap_or(0),
            },
        })
        .chain(files.iter().map(|(path, relative, _)| Entry {
            path: path.clone(),
            root: root.to_path_buf(),
            relative: relative.clone(),
            kind: EntryKind::File,
        }))
        .collect();
    walked.sort_by(|a, b| a.relative.cmp(&b.relative));
    entries.extend(walked);
    Ok(())
}

/// Fingerprint entries in parallel, one digester cache per rayon split
fn fingerprint_entries(
    algorithm: DigestAlgorithm,
    entries: &[Entry],
    sensitivity: &Sensitivity,
) -> Result<Vec<Fingerprint>, FingerprintError> {
    entries
        .par_iter()
        .map_init(DigesterCache::new, |cache, entry| {
            let digester = cache.get_algorithm(algorithm);
            match entry.kind {
                EntryKind::File => fingerprint_file(digester, &entry.path, &entry.root, sensitivity),
                EntryKind::Directory { aggregate_size } => {
                    fingerprint_directory(digester, &entry.path, &entry.root, sensitivity, aggregate_size)
                }
            }
        })
        .collect()
}

fn snapshot_output(
    fingerprinter: &Fingerprinter,
    output: &OutputProperty,
) -> Result<OutputSnapshot, NodeFailure> {
    let mut entries = Vec::new();
    match fs::metadata(&output.path) {
        Ok(metadata) => {
            let found = kind_name(&metadata);
            if found != output.kind.as_str() {
                return Err(FingerprintError::TypeChanged {
                    path: output.path.clone(),
                    expected: output.kind.as_str(),
                    found,
                }
                .into());
            }
            match output.kind {
                OutputKind::File => entries.push(Entry {
                    path: output.path.clone(),
                    root: output.path.clone(),
                    relative: String::new(),
                    kind: EntryKind::File,
                }),
                OutputKind::Directory => {
                    for entry in WalkDir::new(&output.path).sort_by_file_name() {
                        let entry = entry.map_err(|e| {
                            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| output.path.clone());
                            FingerprintError::from_io(path, io::Error::from(e))
                        })?;
                        if !entry.file_type().is_dir() {
                            entries.push(Entry {
                                relative: normalized_relative(entry.path(), &output.path).unwrap_or_default(),
                                path: entry.into_path(),
                                root: output.path.clone(),
                                kind: EntryKind::File,
                            });
                        }
                    }
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(FingerprintError::from_io(&output.path, e).into()),
    }

    let sensitivity = Sensitivity::content_only();
    let fingerprints = fingerprint_entries(fingerprinter.algorithm(), &entries, &sensitivity)?;
    let files: Vec<OutputFile> = entries
        .into_iter()
        .zip(fingerprints)
        .map(|(entry, fingerprint)| OutputFile {
            relative_path: entry.relative,
            fingerprint,
        })
        .collect();

    let mut lease = fingerprinter.lease();
    let digester = lease.digester();
    digester.update_field(b"output");
    digester.update_field(output.kind.as_str().as_bytes());
    if files.is_empty() && !output.path.exists() {
        digester.update_field(b"missing");
    }
    for file in &files {
        digester.update_field(file.relative_path.as_bytes());
        digester.update_field(file.fingerprint.as_str().as_bytes());
    }

    Ok(OutputSnapshot {
        kind: output.kind,
        fingerprint: Fingerprint::from_hex(digester.finish_hex()),
        files,
    })
}
