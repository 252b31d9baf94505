// JSON well-formedness check for automation documents.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LintError {
    #[error("{path}: cannot read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}:{column}: {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },
}

#[derive(Debug, Default)]
pub struct LintReport {
    pub checked: Vec<PathBuf>,
    pub findings: Vec<LintError>,
}

impl LintReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Parse one file and report where it stops being valid JSON
pub fn lint_file(path: &Path) -> Result<(), LintError> {
    let content = fs::read_to_string(path).map_err(|source| LintError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str::<serde_json::Value>(&content)
        .map(|_| ())
        .map_err(|err| LintError::Malformed {
            path: path.to_path_buf(),
            line: err.line(),
            column: err.column(),
            message: err.to_string(),
        })
}

/// Lint every `*.json` file under `roots`. Files given directly are linted
/// whatever their extension.
pub fn lint_paths<P: AsRef<Path>>(roots: &[P]) -> LintReport {
    let mut report = LintReport::default();
    for root in roots {
        let root = root.as_ref();
        let mut files = Vec::new();
        if root.is_dir() {
            if let Err(source) = collect_json(root, &mut files) {
                report.findings.push(LintError::Io {
                    path: root.to_path_buf(),
                    source,
                });
                continue;
            }
        } else {
            files.push(root.to_path_buf());
        }

        for file in files {
            debug!(path = %file.display(), "Linting document");
            if let Err(finding) = lint_file(&file) {
                report.findings.push(finding);
            }
            report.checked.push(file);
        }
    }
    info!(
        checked = report.checked.len(),
        findings = report.findings.len(),
        "Lint finished"
    );
    report
}

fn collect_json(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_json(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    Ok(())
}
