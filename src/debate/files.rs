//! File layout for debate artifacts.

use std::path::{Path, PathBuf};

/// Paths of the files one debate writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebateFiles {
    pub primary: PathBuf,
    pub secondary: PathBuf,
    pub transcript: PathBuf,
    pub final_output: PathBuf,
}

impl DebateFiles {
    /// Lays out files for `phase` of `task_name` under `artifacts_dir`.
    ///
    /// The transcript goes into `<artifacts_dir>/<debate_subdir>/`.
    pub fn new(artifacts_dir: &Path, debate_subdir: &str, phase: &str, task_name: &str) -> Self {
        let stem = format!("{}-{}", file_prefix(phase), task_name);
        Self {
            primary: artifacts_dir.join(format!("{}-primary.md", stem)),
            secondary: artifacts_dir.join(format!("{}-secondary.md", stem)),
            transcript: artifacts_dir
                .join(debate_subdir)
                .join(format!("{}-debate.md", stem)),
            final_output: artifacts_dir.join(format!("{}.md", stem)),
        }
    }

    /// Creates the directories the files live in.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for path in [&self.primary, &self.transcript, &self.final_output] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Short file prefix for a phase name.
pub fn file_prefix(phase: &str) -> String {
    match phase {
        "planning" => "plan".to_string(),
        "code_review" => "review".to_string(),
        other => other.replace('_', "-"),
    }
}
