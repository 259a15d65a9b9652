//! Settings infrastructure for scripture-sync.
//!
//! This module loads `settings.toml` files that tune how documents are parsed:
//! the default paragraph style for delta documents and extra USFM marker
//! classifications.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::usfm::MarkerKind;

/// Root settings structure loaded from settings.toml.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Delta parsing options.
    pub delta: DeltaSettings,

    /// USFM parsing options.
    pub usfm: UsfmSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeltaSettings {
    /// Style given to paragraphs closed by a newline without a `para`
    /// attribute (default: `p`).
    pub default_paragraph_style: String,
}

impl Default for DeltaSettings {
    fn default() -> Self {
        Self {
            default_paragraph_style: "p".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UsfmSettings {
    /// Marker name (without the backslash) -> kind. Overrides the built-in
    /// classification.
    pub markers: HashMap<String, MarkerKind>,
}

/// Load settings from a settings.toml file.
///
/// Returns default settings if the file doesn't exist or can't be parsed.
pub fn load_settings(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse settings.toml");
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

/// Discover settings.toml by searching up the directory tree, then direct children.
///
/// Search order:
/// 1. Walk up from `start_dir` to filesystem root
/// 2. If not found, check immediate child directories of `start_dir`
///
/// Returns `(settings, settings_dir)` where `settings_dir` is the directory
/// containing the found settings.toml.
/// If not found, returns `(Settings::default(), start_dir)`.
pub fn discover_settings(start_dir: &Path) -> (Settings, PathBuf) {
    // Phase 1: Walk up from start_dir
    let mut current = Some(start_dir);
    while let Some(dir) = current {
        let candidate = dir.join("settings.toml");
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "using settings");
            return (load_settings(&candidate), dir.to_path_buf());
        }
        current = dir.parent();
    }

    // Phase 2: Check immediate child directories
    if let Ok(entries) = std::fs::read_dir(start_dir) {
        for entry in entries.flatten() {
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                let candidate = entry.path().join("settings.toml");
                if candidate.is_file() {
                    tracing::debug!(path = %candidate.display(), "using settings");
                    return (load_settings(&candidate), entry.path());
                }
            }
        }
    }

    (Settings::default(), start_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.delta.default_paragraph_style, "p");
        assert!(settings.usfm.markers.is_empty());
    }

    #[test]
    fn parse_full_settings() {
        let settings: Settings = toml::from_str(
            r#"
[delta]
default_paragraph_style = "m"

[usfm]
markers = { zlabel = "paragraph", zw = "character", zn = "note", "zq-s" = "milestone" }
"#,
        )
        .unwrap();
        assert_eq!(settings.delta.default_paragraph_style, "m");
        assert_eq!(settings.usfm.markers.get("zlabel"), Some(&MarkerKind::Paragraph));
        assert_eq!(settings.usfm.markers.get("zw"), Some(&MarkerKind::Character));
        assert_eq!(settings.usfm.markers.get("zn"), Some(&MarkerKind::Note));
        assert_eq!(settings.usfm.markers.get("zq-s"), Some(&MarkerKind::Milestone));
    }

    #[test]
    fn missing_sections_use_defaults() {
        let settings: Settings = toml::from_str("[usfm]\n").unwrap();
        assert_eq!(settings.delta.default_paragraph_style, "p");
    }

    #[test]
    fn unknown_marker_kind_fails() {
        let result: Result<Settings, _> = toml::from_str("[usfm]\nmarkers = { zz = \"bogus\" }\n");
        assert!(result.is_err());
    }

    /// Create a unique temp directory for test isolation.
    fn make_test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("scripture-sync-test")
            .join(name)
            .join(format!("{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Clean up a test directory.
    fn cleanup_test_dir(dir: &Path) {
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn load_settings_invalid_toml_falls_back() {
        let dir = make_test_dir("load-invalid");
        let path = dir.join("settings.toml");
        std::fs::write(&path, "[delta\n").unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.delta.default_paragraph_style, "p");

        cleanup_test_dir(&dir);
    }

    #[test]
    fn discover_settings_in_current_dir() {
        let dir = make_test_dir("discover-current");
        let settings_content = r#"
[delta]
default_paragraph_style = "q1"
"#;
        std::fs::write(dir.join("settings.toml"), settings_content).unwrap();

        let (settings, settings_dir) = discover_settings(&dir);
        assert_eq!(settings_dir, dir);
        assert_eq!(settings.delta.default_paragraph_style, "q1");

        cleanup_test_dir(&dir);
    }

    #[test]
    fn discover_settings_in_parent_dir() {
        let parent = make_test_dir("discover-parent");
        let child = parent.join("subdir");
        std::fs::create_dir_all(&child).unwrap();

        let settings_content = r#"
[usfm]
markers = { zx = "character" }
"#;
        std::fs::write(parent.join("settings.toml"), settings_content).unwrap();

        let (settings, settings_dir) = discover_settings(&child);
        assert_eq!(settings_dir, parent);
        assert_eq!(settings.usfm.markers.get("zx"), Some(&MarkerKind::Character));

        cleanup_test_dir(&parent);
    }

    #[test]
    fn discover_settings_in_child_dir() {
        let parent = make_test_dir("discover-child");
        let child = parent.join("config");
        std::fs::create_dir_all(&child).unwrap();

        std::fs::write(
            child.join("settings.toml"),
            "[delta]\ndefault_paragraph_style = \"m\"\n",
        )
        .unwrap();

        let (settings, settings_dir) = discover_settings(&parent);
        assert_eq!(settings_dir, child);
        assert_eq!(settings.delta.default_paragraph_style, "m");

        cleanup_test_dir(&parent);
    }

    #[test]
    fn discover_settings_not_found() {
        let dir = make_test_dir("discover-none");

        let (settings, settings_dir) = discover_settings(&dir);
        assert_eq!(settings_dir, dir);
        assert!(settings.usfm.markers.is_empty());

        cleanup_test_dir(&dir);
    }

    #[test]
    fn discover_settings_parent_preferred_over_child() {
        let parent = make_test_dir("discover-priority");
        let child = parent.join("nested");
        std::fs::create_dir_all(&child).unwrap();

        std::fs::write(
            parent.join("settings.toml"),
            "[delta]\ndefault_paragraph_style = \"from-parent\"\n",
        )
        .unwrap();
        std::fs::write(
            child.join("settings.toml"),
            "[delta]\ndefault_paragraph_style = \"from-child\"\n",
        )
        .unwrap();

        // Starting from the parent finds its own file before looking at children
        let (settings, settings_dir) = discover_settings(&parent);
        assert_eq!(settings_dir, parent);
        assert_eq!(settings.delta.default_paragraph_style, "from-parent");

        cleanup_test_dir(&parent);
    }
}
