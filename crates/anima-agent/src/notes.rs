use std::path::PathBuf;

use tracing::debug;

use anima_core::config::NotesConfig;

/// Reads per-entity and shared index notes from disk for prompt injection.
/// Layout: `<dir>/<entity-label>/index.md` and `<dir>/shared/index.md`.
pub struct NotesProvider {
    enabled: bool,
    dir: Option<PathBuf>,
}

impl NotesProvider {
    pub fn from_config(config: &NotesConfig) -> Self {
        Self {
            enabled: config.enabled,
            dir: config.dir.as_ref().map(PathBuf::from),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            dir: None,
        }
    }

    pub fn entity_notes(&self, entity_label: &str) -> Option<String> {
        self.read_index(entity_label)
    }

    pub fn shared_notes(&self) -> Option<String> {
        self.read_index("shared")
    }

    fn read_index(&self, subdir: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let path = self.dir.as_ref()?.join(subdir).join("index.md");
        match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => Some(content),
            Ok(_) => None,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no notes index");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_provider_returns_nothing() {
        let notes = NotesProvider::disabled();
        assert!(notes.entity_notes("Aria").is_none());
        assert!(notes.shared_notes().is_none());
    }

    #[test]
    fn reads_entity_and_shared_indexes() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("Aria")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("shared")).expect("mkdir");
        std::fs::write(dir.path().join("Aria/index.md"), "tea preferences").expect("write");
        std::fs::write(dir.path().join("shared/index.md"), "house rules").expect("write");

        let notes = NotesProvider::from_config(&NotesConfig {
            enabled: true,
            dir: Some(dir.path().to_string_lossy().to_string()),
        });
        assert_eq!(notes.entity_notes("Aria").as_deref(), Some("tea preferences"));
        assert_eq!(notes.shared_notes().as_deref(), Some("house rules"));
        assert!(notes.entity_notes("Sol").is_none());
    }
}
