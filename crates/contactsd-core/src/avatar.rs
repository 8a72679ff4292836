use log::{debug, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const AVATAR_FILE_PREFIX: &str = "telepathy_cache";
/// Used when the mime type carries no subtype.
pub const DEFAULT_AVATAR_EXTENSION: &str = "jpeg";

/// Extension from a mime type: `image/png` gives `png`, an empty or
/// subtype-less mime gives [`DEFAULT_AVATAR_EXTENSION`].
pub fn mime_extension(mime: &str) -> String {
    mime.split('/')
        .nth(1)
        .map(|subtype| subtype.split(';').next().unwrap_or("").trim())
        .filter(|subtype| !subtype.is_empty())
        .map(|subtype| subtype.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_AVATAR_EXTENSION.to_string())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredAvatar {
    pub token: String,
    pub extension: String,
    /// `None` when the bytes did not decode as an image.
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct AvatarStore {
    dir: PathBuf,
}

impl AvatarStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/telepathy_cache<token>.<extension>`. Tokens that are not safe
    /// as a file name component are replaced by their hash.
    pub fn file_path(&self, token: &str, extension: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{}.{}",
            AVATAR_FILE_PREFIX,
            file_token(token),
            file_token(extension)
        ))
    }

    pub fn existing(&self, token: &str, extension: &str) -> Option<PathBuf> {
        let path = self.file_path(token, extension);
        path.is_file().then_some(path)
    }

    /// Decodes `data` and writes it under the path derived from the token.
    /// Undecodable data still yields the token and extension, without a path.
    pub fn store(&self, token: &str, mime: &str, data: &[u8]) -> StoredAvatar {
        let extension = mime_extension(mime);
        let path = match image::load_from_memory(data) {
            Ok(image) => {
                debug!(
                    "avatar {} decoded {}x{}",
                    token,
                    image.width(),
                    image.height()
                );
                let path = self.file_path(token, &extension);
                match self.write_atomic(&path, data) {
                    Ok(()) => Some(path),
                    Err(err) => {
                        warn!("could not write avatar {}: {}", path.display(), err);
                        None
                    }
                }
            }
            Err(err) => {
                warn!("avatar {} ({}) is not a decodable image: {}", token, mime, err);
                None
            }
        };
        StoredAvatar {
            token: token.to_string(),
            extension,
            path,
        }
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(data)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|err| err.error)?;
        Ok(())
    }
}

fn file_token(value: &str) -> String {
    let safe = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'));
    if safe {
        value.to_string()
    } else {
        blake3::hash(value.as_bytes()).to_hex().to_string()
    }
}
