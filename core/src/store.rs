use crate::credentials::Credential;
use crate::error::{ClientError, ClientResult};
use directories::ProjectDirs;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// JSON file holding the signed-in credential pair.
#[derive(Clone, Debug)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/parley/credentials.json`, or `credentials.json` in the
    /// working directory when no home directory can be resolved.
    pub fn default_location() -> PathBuf {
        ProjectDirs::from("", "", "parley")
            .map(|dirs| dirs.data_dir().join("credentials.json"))
            .unwrap_or_else(|| PathBuf::from("credentials.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> ClientResult<Option<Credential>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(storage_error(&self.path, err)),
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| storage_error(&self.path, err))
    }

    pub fn save(&self, credential: &Credential) -> ClientResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| storage_error(parent, err))?;
        }
        let serialized =
            serde_json::to_vec_pretty(credential).map_err(|err| storage_error(&self.path, err))?;
        fs::write(&self.path, serialized).map_err(|err| storage_error(&self.path, err))
    }

    pub fn clear(&self) -> ClientResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_error(&self.path, err)),
        }
    }
}

fn storage_error(path: &Path, err: impl std::fmt::Display) -> ClientError {
    ClientError::Storage(format!("{}: {err}", path.display()))
}
