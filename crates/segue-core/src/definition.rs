//! Unit definitions - the immutable description of a DSP program.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Where a definition's source text lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DspSource {
    /// Source held inline (dropped text, editor buffer).
    Inline(String),
    /// Source read from a file on disk.
    Path(PathBuf),
}

impl DspSource {
    /// Resolve the source to its text, reading the file if needed.
    pub fn read(&self) -> std::io::Result<String> {
        match self {
            DspSource::Inline(text) => Ok(text.clone()),
            DspSource::Path(path) => std::fs::read_to_string(path),
        }
    }
}

/// Where a definition's compiled unit runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionTarget {
    /// Compiled and computed in-process.
    Local,
    /// Compiled and computed on a remote processing node.
    Remote { host: String, port: u16 },
}

impl ExecutionTarget {
    pub fn is_local(&self) -> bool {
        matches!(self, ExecutionTarget::Local)
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionTarget::Local => write!(f, "local"),
            ExecutionTarget::Remote { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Immutable description of a DSP program.
///
/// Owned by the session as an `Arc`; windows reference it. Two definitions
/// with the same source text and compile options share a [`content_key`]
/// and therefore a factory.
///
/// [`content_key`]: UnitDefinition::content_key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDefinition {
    name: String,
    source: DspSource,
    target: ExecutionTarget,
    compile_options: Vec<String>,
}

impl UnitDefinition {
    pub fn new(
        name: impl Into<String>,
        source: DspSource,
        target: ExecutionTarget,
        compile_options: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            source,
            target,
            compile_options,
        })
    }

    /// Local inline-source definition with no compile options.
    pub fn local(name: impl Into<String>, source: impl Into<String>) -> Arc<Self> {
        Self::new(
            name,
            DspSource::Inline(source.into()),
            ExecutionTarget::Local,
            Vec::new(),
        )
    }

    /// Remote inline-source definition with no compile options.
    pub fn remote(
        name: impl Into<String>,
        source: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Arc<Self> {
        Self::new(
            name,
            DspSource::Inline(source.into()),
            ExecutionTarget::Remote {
                host: host.into(),
                port,
            },
            Vec::new(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &DspSource {
        &self.source
    }

    pub fn target(&self) -> &ExecutionTarget {
        &self.target
    }

    pub fn compile_options(&self) -> &[String] {
        &self.compile_options
    }

    /// Same program, retargeted. Used by the fallback-to-local path.
    pub fn with_target(&self, target: ExecutionTarget) -> Arc<Self> {
        Arc::new(Self {
            name: self.name.clone(),
            source: self.source.clone(),
            target,
            compile_options: self.compile_options.clone(),
        })
    }

    /// Stable identity of the compiled artifact: SHA-256 over the resolved
    /// source text and the compile options. The execution target is excluded -
    /// the same program migrated between machines keeps its key.
    ///
    /// File sources that cannot be read hash the path instead, so a missing
    /// file still produces a deterministic (and cache-missing) key.
    pub fn content_key(&self) -> String {
        let mut hasher = Sha256::new();
        match self.source.read() {
            Ok(text) => hasher.update(text.as_bytes()),
            Err(_) => {
                if let DspSource::Path(path) = &self.source {
                    hasher.update(path.to_string_lossy().as_bytes());
                }
            }
        }
        for opt in &self.compile_options {
            hasher.update([0u8]);
            hasher.update(opt.as_bytes());
        }
        let digest = hasher.finalize();
        let mut key = String::with_capacity(64);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(key, "{:02x}", byte);
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_source_same_key() {
        let a = UnitDefinition::local("a", "sine 440");
        let b = UnitDefinition::local("b", "sine 440");
        assert_eq!(a.content_key(), b.content_key());
    }

    #[test]
    fn test_key_ignores_target() {
        let local = UnitDefinition::local("x", "sine 440");
        let remote = UnitDefinition::remote("x", "sine 440", "10.0.0.2", 7000);
        assert_eq!(local.content_key(), remote.content_key());
    }

    #[test]
    fn test_options_change_key() {
        let plain = UnitDefinition::local("x", "sine 440");
        let tuned = UnitDefinition::new(
            "x",
            DspSource::Inline("sine 440".into()),
            ExecutionTarget::Local,
            vec!["-vec".into()],
        );
        assert_ne!(plain.content_key(), tuned.content_key());
    }

    #[test]
    fn test_retarget_keeps_program() {
        let remote = UnitDefinition::remote("x", "gain 0.5", "node-1", 7000);
        let local = remote.with_target(ExecutionTarget::Local);
        assert!(local.target().is_local());
        assert_eq!(local.name(), "x");
        assert_eq!(remote.content_key(), local.content_key());
    }
}
