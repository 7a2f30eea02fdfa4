//! Process-start configuration loading (spec.md §6, §4.5.1): parses
//! `--defaults-file` and validates it before any reconciler starts.

use std::path::Path;

use crate::defaults::{self, Defaults, DefaultsError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read defaults file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse defaults file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("defaults file {path} failed validation: {source}")]
    Invalid {
        path: String,
        #[source]
        source: DefaultsError,
    },
}

/// Loads and validates the defaults document at `path`. Startup failure
/// here is fatal (exit 1 at the call site), never a reconcile-time error.
pub fn load_defaults(path: &Path) -> Result<Defaults, ConfigError> {
    let path_str = path.display().to_string();

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path_str.clone(),
        source,
    })?;

    let parsed: Defaults = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path_str.clone(),
        source,
    })?;

    defaults::validate(&parsed).map_err(|source| ConfigError::Invalid {
        path: path_str,
        source,
    })?;

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    struct TempFile(PathBuf);

    impl TempFile {
        fn with_contents(unique: &str, contents: &str) -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!("loadtest-operator-config-test-{}-{unique}.yaml", std::process::id()));
            let mut f = std::fs::File::create(&path).expect("create temp file");
            f.write_all(contents.as_bytes()).expect("write temp file");
            Self(path)
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    const VALID_YAML: &str = r#"
componentNamespace: benchmarks
defaultPoolLabels:
  driver: "true"
  client: "true"
  server: "true"
cloneImage: clone:latest
readyImage: ready:latest
driverImage: driver:latest
languages:
  - language: cxx
    buildImage: cxx-build:latest
    runImage: cxx-run:latest
killAfter: 30
"#;

    #[test]
    fn test_load_defaults_valid_file() {
        let tmp = TempFile::with_contents("valid", VALID_YAML);
        let defaults = load_defaults(&tmp.0).unwrap();
        assert_eq!(defaults.component_namespace, "benchmarks");
    }

    #[test]
    fn test_load_defaults_missing_file() {
        let err = load_defaults(Path::new("/nonexistent/defaults.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_defaults_invalid_yaml() {
        let tmp = TempFile::with_contents("bad-yaml", "not: [valid, yaml: structure");
        let err = load_defaults(&tmp.0).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_defaults_rejects_invalid_document() {
        let tmp = TempFile::with_contents(
            "invalid-doc",
            "cloneImage: \"\"\nreadyImage: r\ndriverImage: d\nkillAfter: 30\n",
        );
        let err = load_defaults(&tmp.0).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
