// Attachment resolution shared by both adapters.
// BinaryRef → platform handle (no upload) or a local file ready for upload.
// Files created here are temp files owned by `LocalMedia` and removed on drop,
// so every exit path (upload failure, task cancellation) cleans up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use reqwest::Client;

use super::types::{BinaryRef, MediaError};
use super::util::{file_ext, mime_to_ext, sanitize_filename};
use crate::ulog_debug;

/// Maximum remote download size (20 MB, same as the Telegram Bot API file limit)
pub(crate) const MAX_DOWNLOAD_SIZE: usize = 20 * 1024 * 1024;

/// A local file to upload. Temporary files are deleted when this is dropped.
#[derive(Debug)]
pub struct LocalMedia {
    path: PathBuf,
    file_name: String,
    _temp: Option<tempfile::TempPath>,
}

impl LocalMedia {
    fn existing(path: PathBuf, name_hint: Option<&str>) -> Self {
        let file_name = name_hint
            .map(sanitize_filename)
            .or_else(|| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(sanitize_filename)
            })
            .unwrap_or_else(|| "file".to_string());
        Self { path, file_name, _temp: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name announced to the platform on upload
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn is_temporary(&self) -> bool {
        self._temp.is_some()
    }

    pub async fn read(&self) -> Result<Vec<u8>, MediaError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| MediaError::Io(format!("{}: {}", self.path.display(), e)))
    }
}

/// Outcome of resolving one binary reference
#[derive(Debug)]
pub enum ResolvedMedia {
    /// Platform-native id, referenced directly
    Handle(String),
    Local(LocalMedia),
}

/// Turns `BinaryRef`s into uploadable content
pub struct MediaResolver {
    client: Client,
    temp_dir: PathBuf,
}

impl MediaResolver {
    pub fn new(client: Client, temp_dir: PathBuf) -> Self {
        Self { client, temp_dir }
    }

    /// Resolve by priority: handle → URL download → inline decode → local path.
    /// `default_ext` names temp files whose type cannot be inferred.
    pub async fn resolve(
        &self,
        source: &BinaryRef,
        name_hint: Option<&str>,
        default_ext: &str,
    ) -> Result<ResolvedMedia, MediaError> {
        match source {
            BinaryRef::OpaqueHandle(handle) => Ok(ResolvedMedia::Handle(handle.clone())),
            BinaryRef::RemoteUrl(url) => {
                let media = self.download(url, name_hint, default_ext).await?;
                Ok(ResolvedMedia::Local(media))
            }
            BinaryRef::InlineBytes(payload) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(payload.trim())
                    .map_err(|e| MediaError::Decode(e.to_string()))?;
                let file_name = name_hint
                    .map(sanitize_filename)
                    .unwrap_or_else(|| format!("inline.{}", default_ext));
                let media = self.write_temp(&bytes, file_name).await?;
                Ok(ResolvedMedia::Local(media))
            }
            BinaryRef::LocalPath(path) => {
                Ok(ResolvedMedia::Local(LocalMedia::existing(path.clone(), name_hint)))
            }
        }
    }

    async fn download(
        &self,
        url: &str,
        name_hint: Option<&str>,
        default_ext: &str,
    ) -> Result<LocalMedia, MediaError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MediaError::Download(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MediaError::Download(format!("HTTP {} for {}", resp.status(), url)));
        }
        if let Some(len) = resp.content_length() {
            if len as usize > MAX_DOWNLOAD_SIZE {
                return Err(MediaError::TooLarge(len as usize));
            }
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| MediaError::Download(e.to_string()))?;

        // Double-check actual downloaded size
        if bytes.len() > MAX_DOWNLOAD_SIZE {
            return Err(MediaError::TooLarge(bytes.len()));
        }

        let file_name = match name_hint {
            Some(name) => sanitize_filename(name),
            None => name_from_url(url).unwrap_or_else(|| {
                let ext = content_type
                    .as_deref()
                    .map(mime_to_ext)
                    .filter(|e| *e != "bin")
                    .unwrap_or(default_ext);
                format!("download.{}", ext)
            }),
        };
        ulog_debug!("[im-media] Downloaded {} ({} bytes)", url, bytes.len());
        self.write_temp(&bytes, file_name).await
    }

    /// Write bytes into a fresh temp file under `temp_dir`
    async fn write_temp(&self, bytes: &[u8], file_name: String) -> Result<LocalMedia, MediaError> {
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| MediaError::Io(format!("{}: {}", self.temp_dir.display(), e)))?;

        let suffix = file_ext(&file_name)
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        let temp = tempfile::Builder::new()
            .prefix("imbridge-")
            .suffix(&suffix)
            .tempfile_in(&self.temp_dir)
            .map_err(|e| MediaError::Io(e.to_string()))?
            .into_temp_path();

        // On write failure `temp` drops here and the file is removed
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| MediaError::Io(e.to_string()))?;

        Ok(LocalMedia {
            path: temp.to_path_buf(),
            file_name,
            _temp: Some(temp),
        })
    }
}

/// Last URL path component, if it looks like a file name
fn name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let last = path.rsplit('/').next()?;
    if last.is_empty() || !last.contains('.') || path.ends_with("//") {
        return None;
    }
    Some(sanitize_filename(last))
}

/// Platform handles produced by uploads during a single send.
/// A reference already uploaded in this send is never uploaded again.
/// Handles are typed on both platforms, so entries are scoped by media kind.
#[derive(Debug, Default)]
pub struct UploadCache {
    handles: HashMap<(&'static str, BinaryRef), String>,
}

impl UploadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: &'static str, source: &BinaryRef) -> Option<&str> {
        self.handles
            .get(&(kind, source.clone()))
            .map(String::as_str)
    }

    pub fn insert(&mut self, kind: &'static str, source: &BinaryRef, handle: String) {
        self.handles.insert((kind, source.clone()), handle);
    }
}
