//! Project command detection.
//!
//! Picks lint, typecheck, test and build commands from the marker files in a
//! project directory. Configured overrides always win.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Commands for one project. Any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedCommands {
    #[serde(default)]
    pub lint: Option<String>,
    #[serde(default)]
    pub typecheck: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
}

impl DetectedCommands {
    /// Overlays `overrides` on top of `self`, field by field.
    pub fn with_overrides(self, overrides: &DetectedCommands) -> Self {
        Self {
            lint: overrides.lint.clone().or(self.lint),
            typecheck: overrides.typecheck.clone().or(self.typecheck),
            test: overrides.test.clone().or(self.test),
            build: overrides.build.clone().or(self.build),
        }
    }
}

/// Marker files in detection priority order.
const MARKERS: &[&str] = &[
    "Cargo.toml",
    "go.mod",
    "pyproject.toml",
    "setup.py",
    "package.json",
    "pom.xml",
    "build.gradle",
    "Gemfile",
    "Makefile",
];

/// Returns the highest-priority marker present in `project_path`.
pub fn detect_project_type(project_path: &Path) -> Option<&'static str> {
    MARKERS
        .iter()
        .copied()
        .find(|marker| project_path.join(marker).is_file())
}

/// Detects the commands for the project at `project_path`.
pub fn detect(project_path: &Path) -> DetectedCommands {
    let Some(marker) = detect_project_type(project_path) else {
        tracing::debug!(path = ?project_path, "no project marker found");
        return DetectedCommands::default();
    };

    let cmd = |s: &str| Some(s.to_string());
    let commands = match marker {
        "Cargo.toml" => DetectedCommands {
            lint: cmd("cargo clippy -- -D warnings"),
            typecheck: None,
            test: cmd("cargo test"),
            build: cmd("cargo build"),
        },
        "go.mod" => DetectedCommands {
            lint: cmd("go vet ./..."),
            typecheck: None,
            test: cmd("go test ./..."),
            build: cmd("go build ./..."),
        },
        "pyproject.toml" => DetectedCommands {
            lint: cmd("ruff check --fix ."),
            typecheck: cmd("mypy ."),
            test: cmd("pytest"),
            build: cmd("python -m build"),
        },
        "setup.py" => DetectedCommands {
            lint: cmd("flake8 ."),
            typecheck: cmd("mypy ."),
            test: cmd("pytest"),
            build: cmd("python setup.py build"),
        },
        "package.json" => detect_npm(&project_path.join(marker)),
        "pom.xml" => DetectedCommands {
            lint: cmd("mvn checkstyle:check"),
            typecheck: None,
            test: cmd("mvn test"),
            build: cmd("mvn package"),
        },
        "build.gradle" => DetectedCommands {
            lint: cmd("./gradlew check"),
            typecheck: None,
            test: cmd("./gradlew test"),
            build: cmd("./gradlew build"),
        },
        "Gemfile" => DetectedCommands {
            lint: cmd("bundle exec rubocop"),
            typecheck: None,
            test: cmd("bundle exec rspec"),
            build: cmd("bundle install"),
        },
        "Makefile" => DetectedCommands {
            lint: cmd("make lint"),
            typecheck: None,
            test: cmd("make test"),
            build: cmd("make build"),
        },
        _ => DetectedCommands::default(),
    };

    tracing::info!(marker = %marker, commands = ?commands, "detected project commands");
    commands
}

/// npm commands, limited to scripts the package actually defines.
fn detect_npm(package_json: &Path) -> DetectedCommands {
    let scripts = std::fs::read_to_string(package_json)
        .ok()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        .and_then(|v| v.get("scripts").cloned())
        .unwrap_or(serde_json::Value::Null);

    let has = |name: &str| scripts.get(name).is_some();
    DetectedCommands {
        lint: has("lint").then(|| "npm run lint".to_string()),
        typecheck: has("typecheck").then(|| "npm run typecheck".to_string()),
        test: has("test").then(|| "npm test".to_string()),
        build: has("build").then(|| "npm run build".to_string()),
    }
}
