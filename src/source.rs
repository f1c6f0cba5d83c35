//! Resolution of a file reference into readable upload content

use crate::error::TransferError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Open content ready to stream into a request body
pub struct UploadSource {
    /// File name sent in the multipart `Content-Disposition`
    pub file_name: String,
    /// Size in bytes, if the resolver could determine it
    pub length: Option<u64>,
    /// The content
    pub reader: Pin<Box<dyn AsyncRead + Send + Sync>>,
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSource")
            .field("file_name", &self.file_name)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Turns an upload's opaque file reference into content
///
/// A reference that cannot be opened must yield
/// [`TransferError::FileNotFound`]; the upload then fails terminally.
#[async_trait]
pub trait FileResolver: Send + Sync {
    /// Open the content behind `reference`
    async fn open(&self, reference: &str) -> Result<UploadSource, TransferError>;
}

/// Resolves local paths and `file://` URLs
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileResolver;

impl LocalFileResolver {
    fn to_path(reference: &str) -> Result<PathBuf, TransferError> {
        if reference.starts_with("file:") {
            let url = url::Url::parse(reference)
                .map_err(|e| TransferError::FileNotFound(format!("{}: {}", reference, e)))?;
            return url
                .to_file_path()
                .map_err(|_| TransferError::FileNotFound(format!("{}: not a local path", reference)));
        }
        Ok(PathBuf::from(reference))
    }

    fn file_name(path: &Path) -> String {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string())
    }
}

#[async_trait]
impl FileResolver for LocalFileResolver {
    async fn open(&self, reference: &str) -> Result<UploadSource, TransferError> {
        let path = Self::to_path(reference)?;

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| TransferError::FileNotFound(format!("{}: {}", path.display(), e)))?;

        let metadata = file
            .metadata()
            .await
            .map_err(|e| TransferError::FileNotFound(format!("{}: {}", path.display(), e)))?;
        if metadata.is_dir() {
            return Err(TransferError::FileNotFound(format!(
                "{}: is a directory",
                path.display()
            )));
        }

        Ok(UploadSource {
            file_name: Self::file_name(&path),
            length: Some(metadata.len()),
            reader: Box::pin(file),
        })
    }
}
