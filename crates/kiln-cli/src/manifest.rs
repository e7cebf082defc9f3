//! Build manifest (`kiln.json`) - shell steps turned into work nodes

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kiln_core::hasher::Normalizer;
use kiln_core::schema::{FileKind, OutputKind};
use kiln_core::{ExecutionContext, FileInput, OutputProperty, PropertyBehavior, WorkAction, WorkGraph, WorkNode, WorkSchema};
use serde::Deserialize;

pub const MANIFEST_FILE: &str = "kiln.json";

#[derive(Debug, Deserialize)]
pub struct Manifest {
    /// Shared resource name -> max concurrent holders
    #[serde(default)]
    pub resources: BTreeMap<String, usize>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub must_run_after: Vec<String>,
    #[serde(default)]
    pub should_run_after: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<Input>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub destroys: Vec<PathBuf>,
    #[serde(default)]
    pub resources: Vec<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub untracked: bool,
}

#[derive(Debug, Deserialize)]
pub struct Input {
    pub name: String,
    pub paths: Vec<PathBuf>,
    /// Inferred from the paths when absent; a trailing `/` declares a directory
    pub kind: Option<FileKind>,
    #[serde(default)]
    pub sensitivity: Normalizer,
    #[serde(default)]
    pub behavior: PropertyBehavior,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub normalize_line_endings: bool,
    #[serde(default)]
    pub ignore_empty_directories: bool,
}

#[derive(Debug, Deserialize)]
pub struct Output {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_output_kind")]
    pub kind: OutputKind,
}

fn default_output_kind() -> OutputKind {
    OutputKind::File
}

/// Read and parse a manifest
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read manifest {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Malformed manifest {}", path.display()))
}

impl Manifest {
    /// Build the work graph; relative paths resolve against `root`
    pub fn into_graph(self, root: &Path) -> Result<WorkGraph> {
        let mut graph = WorkGraph::new();
        for (name, max_holders) in self.resources {
            graph.declare_resource(name, max_holders)?;
        }
        for step in self.steps {
            graph.add_node(step.into_node(root)?)?;
        }
        Ok(graph)
    }
}

impl Step {
    fn into_node(self, root: &Path) -> Result<WorkNode> {
        let mut schema = WorkSchema::builder();
        for input in self.inputs {
            schema = schema.file(input.into_file_input(root)?);
        }
        for (name, value) in self.properties {
            schema = schema.scalar(name, value);
        }
        for output in self.outputs {
            let path = root.join(&output.path);
            schema = schema.output(match output.kind {
                OutputKind::File => OutputProperty::file(output.name, path),
                OutputKind::Directory => OutputProperty::directory(output.name, path),
            });
        }
        for path in self.destroys {
            schema = schema.destroys(root.join(path));
        }
        if self.untracked {
            schema = schema.untracked();
        }

        let mut node = WorkNode::new(
            self.name,
            ShellAction {
                command: self.command,
                root: root.to_path_buf(),
            },
        )
        .schema(schema.build());
        for dep in self.depends_on {
            node = node.depends_on(dep.as_str());
        }
        for dep in self.must_run_after {
            node = node.must_run_after(dep.as_str());
        }
        for dep in self.should_run_after {
            node = node.should_run_after(dep.as_str());
        }
        for resource in self.resources {
            node = node.uses_resource(resource);
        }
        if let Some(secs) = self.timeout_secs {
            node = node.timeout(Duration::from_secs(secs));
        }
        Ok(node)
    }
}

impl Input {
    fn into_file_input(self, root: &Path) -> Result<FileInput> {
        let paths: Vec<PathBuf> = self.paths.iter().map(|p| root.join(p)).collect();
        let kind = match (self.kind, self.paths.as_slice()) {
            (Some(kind), _) => kind,
            (None, [single]) => infer_kind(single, &paths[0]),
            (None, _) => FileKind::Files,
        };

        let mut input = match kind {
            FileKind::File | FileKind::Directory if paths.len() != 1 => {
                bail!("input '{}' needs exactly one path", self.name)
            }
            FileKind::File => FileInput::file(self.name.as_str(), &paths[0]),
            FileKind::Directory => FileInput::directory(self.name.as_str(), &paths[0]),
            FileKind::Files => FileInput::files(self.name.as_str(), paths),
        }
        .normalizer(self.sensitivity)
        .behavior(self.behavior);

        if self.normalize_line_endings {
            input = input.normalize_line_endings();
        }
        if self.ignore_empty_directories {
            input = input.ignore_empty_directories();
        }
        for pattern in &self.include {
            input = input
                .include(pattern)
                .with_context(|| format!("bad include pattern '{}' on input '{}'", pattern, self.name))?;
        }
        for pattern in &self.exclude {
            input = input
                .exclude(pattern)
                .with_context(|| format!("bad exclude pattern '{}' on input '{}'", pattern, self.name))?;
        }
        Ok(input)
    }
}

/// A trailing slash marks a directory that may not exist yet; otherwise
/// existing directories are directories and everything else a file
fn infer_kind(declared: &Path, resolved: &Path) -> FileKind {
    let spelled_as_dir = declared
        .as_os_str()
        .to_str()
        .is_some_and(|p| p.ends_with('/') || p.ends_with(std::path::MAIN_SEPARATOR));
    if spelled_as_dir || resolved.is_dir() {
        FileKind::Directory
    } else {
        FileKind::File
    }
}

/// Runs a command through `sh -c` in the project root
pub struct ShellAction {
    command: String,
    root: PathBuf,
}

impl WorkAction for ShellAction {
    fn execute(&self, context: &ExecutionContext) -> Result<()> {
        let changes = context.changes();
        let changed: Vec<String> = changes
            .added
            .iter()
            .chain(&changes.modified)
            .map(|p| p.display().to_string())
            .collect();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.root)
            .env("KILN_NODE", context.node().as_str())
            .env("KILN_FULL_REBUILD", if changes.full_rebuild { "1" } else { "0" })
            .env("KILN_CHANGED_FILES", changed.join("\n"))
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.command))?;

        let mut stderr_pipe = child.stderr.take();
        let reader = std::thread::spawn(move || {
            let mut stderr = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            stderr
        });

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if context.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                bail!("'{}' killed after cancellation", self.command);
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        let stderr = reader.join().unwrap_or_default();

        if !status.success() {
            bail!("'{}' exited with {}: {}", self.command, status, stderr.trim());
        }
        eprint!("{}", stderr);
        Ok(())
    }

    fn implementation_id(&self) -> String {
        format!("sh -c {}", self.command)
    }
}
