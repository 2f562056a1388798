use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};

pub type JsonFileResult<T> = Result<T, JsonFileError>;

/// Failures of the on-disk JSON documents the client keeps.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum JsonFileError {
    #[snafu(display("failed to read {path:?} on `{stage}`: {source}"))]
    ReadFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse {path:?} on `{stage}`: {source}"))]
    Parse {
        stage: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("failed to create directory {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize {path:?} on `{stage}`: {source}"))]
    Serialize {
        stage: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to move {from:?} over {to:?} on `{stage}`: {source}"))]
    Replace {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to remove {path:?} on `{stage}`: {source}"))]
    RemoveFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

impl JsonFileError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::ReadFile { stage, .. }
            | Self::Parse { stage, .. }
            | Self::CreateDir { stage, .. }
            | Self::Serialize { stage, .. }
            | Self::WriteFile { stage, .. }
            | Self::Replace { stage, .. }
            | Self::RemoveFile { stage, .. } => *stage,
        }
    }
}

/// Reads a JSON document. A missing or blank file reads as `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> JsonFileResult<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error).context(ReadFileSnafu {
                stage: "read-json-file",
                path: path.to_path_buf(),
            });
        }
    };
    if content.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&content)
        .map(Some)
        .context(ParseSnafu {
            stage: "parse-json-file",
            path: path.to_path_buf(),
        })
}

/// Replaces `path` with `value` through a sibling temp file, so readers never see half a document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> JsonFileResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context(CreateDirSnafu {
            stage: "create-json-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let content = serde_json::to_string_pretty(value).context(SerializeSnafu {
        stage: "serialize-json",
        path: path.to_path_buf(),
    })?;

    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).context(WriteFileSnafu {
        stage: "write-temporary-json-file",
        path: temp_path.clone(),
    })?;

    std::fs::rename(&temp_path, path).context(ReplaceSnafu {
        stage: "replace-json-file",
        from: temp_path,
        to: path.to_path_buf(),
    })
}

/// Deletes the document; an absent file is already removed.
pub fn remove_json(path: &Path) -> JsonFileResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error).context(RemoveFileSnafu {
            stage: "remove-json-file",
            path: path.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Document {
        name: String,
    }

    #[test]
    fn write_replaces_without_leaving_the_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("doc.json");

        write_json_atomic(&path, &Document { name: "one".into() }).unwrap();
        write_json_atomic(&path, &Document { name: "two".into() }).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(
            read_json::<Document>(&path).unwrap(),
            Some(Document { name: "two".into() })
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &Document { name: "x".into() }).unwrap();

        remove_json(&path).unwrap();
        remove_json(&path).unwrap();

        assert_eq!(read_json::<Document>(&path).unwrap(), None);
    }
}
