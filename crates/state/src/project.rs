use std::fs;
use std::path::{Path, PathBuf};

use montage_media::error::{Error, Result};
use serde_json::{Value, json};
use tracing::{error, info};

pub const VER_MAJOR: u8 = 1;
pub const VER_MINOR: u8 = 0;

/// Manifest file extension: `<projName>.mep` inside the project folder.
const PROJECT_FILE_EXT: &str = "mep";

fn current_version() -> u32 {
    (u32::from(VER_MAJOR) << 24) | (u32::from(VER_MINOR) << 16)
}

/// A named on-disk workspace holding the serialized timeline and settings
/// as an opaque JSON tree. At most one project is open at a time; opening
/// or creating another one saves the current project first.
pub struct Project {
    name: String,
    dir: PathBuf,
    file_path: PathBuf,
    version: u32,
    content: Value,
    opened: bool,
}

impl Default for Project {
    fn default() -> Self {
        Self::new()
    }
}

impl Project {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            dir: PathBuf::new(),
            file_path: PathBuf::new(),
            version: 0,
            content: Value::Null,
            opened: false,
        }
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn set_content(&mut self, content: Value) {
        self.content = content;
    }

    /// Creates `<base_dir>/<name>/` and starts a fresh project there. A
    /// previously opened project is saved first; a failed save aborts.
    pub fn create_new(&mut self, name: &str, base_dir: &Path) -> Result<()> {
        if self.opened {
            self.save().inspect_err(|e| {
                error!(project = %self.name, error = %e, "failed to save current project before creating a new one");
            })?;
        }

        let project_dir = base_dir.join(name);
        if project_dir.exists() {
            return Err(Error::AlreadyExists(format!(
                "project directory {} already exists",
                project_dir.display()
            )));
        }
        fs::create_dir_all(&project_dir).map_err(|e| {
            Error::MkdirFailed(format!("{}: {e}", project_dir.display()))
        })?;

        self.name = name.to_string();
        self.file_path = project_dir.join(format!("{name}.{PROJECT_FILE_EXT}"));
        self.dir = project_dir;
        self.version = current_version();
        self.content = json!({});
        self.opened = true;
        info!(project = %self.name, dir = %self.dir.display(), "project created");
        Ok(())
    }

    /// Loads a project manifest. Files predating the versioned layout
    /// load their whole tree as content, named after the file.
    pub fn load(&mut self, project_file: &Path) -> Result<()> {
        if self.opened {
            self.save().inspect_err(|e| {
                error!(project = %self.name, error = %e, "failed to save current project before loading another");
            })?;
        }

        if !project_file.is_file() {
            return Err(Error::FileInvalid(format!(
                "{} is not a file",
                project_file.display()
            )));
        }
        let text = fs::read_to_string(project_file)?;
        let manifest: Value = serde_json::from_str(&text)
            .map_err(|e| Error::ParseFailed(format!("{}: {e}", project_file.display())))?;

        match manifest.get("mec_proj_version").and_then(Value::as_u64) {
            Some(version) => {
                self.version = version as u32;
                self.name = manifest
                    .get("proj_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.content = manifest
                    .get("proj_content")
                    .cloned()
                    .unwrap_or(Value::Null);
                self.dir = project_file
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
            }
            None => {
                self.name = project_file
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.content = manifest;
                self.version = 0;
                self.dir = project_file
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
            }
        }
        self.file_path = project_file.to_path_buf();
        self.opened = true;
        info!(project = %self.name, "project loaded");
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if !self.opened {
            return Err(Error::NotOpened);
        }
        if !self.content.is_object() {
            return Err(Error::InvalidState(
                "project content is not a json object".to_string(),
            ));
        }
        let manifest = json!({
            "mec_proj_version": self.version,
            "proj_name": self.name,
            "proj_content": self.content,
        });
        let text = serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::ParseFailed(e.to_string()))?;
        fs::write(&self.file_path, text)?;
        Ok(())
    }

    /// Closes the project; with `save_before_close`, a failed save aborts
    /// the close and the project stays open.
    pub fn close(&mut self, save_before_close: bool) -> Result<()> {
        if !self.opened {
            return Ok(());
        }
        if save_before_close {
            self.save().inspect_err(|e| {
                error!(project = %self.name, error = %e, "failed to save project before closing");
            })?;
        }
        self.name.clear();
        self.dir = PathBuf::new();
        self.file_path = PathBuf::new();
        self.version = 0;
        self.content = Value::Null;
        self.opened = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::Project;

    fn scratch_dir(tag: &str) -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "montage-project-{tag}-{}-{unique}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn create_save_load_round_trip() {
        let base = scratch_dir("roundtrip");
        let mut project = Project::new();
        project.create_new("demo", &base).expect("create");
        project.set_content(json!({ "a": 1 }));
        project.save().expect("save");

        let file = base.join("demo").join("demo.mep");
        let mut loaded = Project::new();
        loaded.load(&file).expect("load");
        assert_eq!(loaded.name(), "demo");
        assert_eq!(loaded.version(), 1 << 24);
        assert_eq!(loaded.content(), &json!({ "a": 1 }));

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn create_over_existing_dir_fails() {
        let base = scratch_dir("exists");
        std::fs::create_dir_all(base.join("taken")).expect("pre-existing dir");
        let mut project = Project::new();
        assert!(project.create_new("taken", &base).is_err());
        assert!(!project.is_opened());

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn legacy_manifest_loads_whole_file_as_content() {
        let base = scratch_dir("legacy");
        let file = base.join("old_cut.mep");
        std::fs::write(&file, r#"{ "tracks": [1, 2] }"#).expect("write legacy file");

        let mut project = Project::new();
        project.load(&file).expect("load");
        assert_eq!(project.name(), "old_cut");
        assert_eq!(project.version(), 0);
        assert_eq!(project.content(), &json!({ "tracks": [1, 2] }));

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn save_requires_object_content() {
        let base = scratch_dir("badcontent");
        let mut project = Project::new();
        project.create_new("p", &base).expect("create");
        project.set_content(json!(42));
        assert!(project.save().is_err());
        // the failed save also aborts a saving close
        assert!(project.close(true).is_err());
        assert!(project.is_opened());
        project.close(false).expect("close without save");
        assert!(!project.is_opened());

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn creating_second_project_saves_the_first() {
        let base = scratch_dir("autosave");
        let mut project = Project::new();
        project.create_new("first", &base).expect("create first");
        project.set_content(json!({ "n": 1 }));
        project.create_new("second", &base).expect("create second");

        let mut reopened = Project::new();
        reopened
            .load(&base.join("first").join("first.mep"))
            .expect("first was saved on switch");
        assert_eq!(reopened.content(), &json!({ "n": 1 }));

        let _ = std::fs::remove_dir_all(&base);
    }
}
