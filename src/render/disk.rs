//! On-disk page store: one directory per document, one PNG per page

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use log::{debug, warn};
use tempfile::TempDir;

use super::request::{RenderError, Result};
use super::types::{PageImage, PageRecord};

const PAGE_EXTENSION: &str = "png";
const TRASH_PREFIX: &str = ".trash-";

/// A document's page directory moved out of the store, awaiting deletion.
pub struct DetachedPages {
    document: String,
    trash: TempDir,
}

impl DetachedPages {
    /// Delete the detached pages.
    pub fn remove(self) -> io::Result<()> {
        let trash = self.trash.path().to_path_buf();
        if let Err(e) = self.trash.close() {
            warn!("Failed to remove {trash:?}: {e}");
            return Err(e);
        }
        debug!("Removed pages for: {}", self.document);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DiskPageStore {
    base_dir: PathBuf,
}

impl DiskPageStore {
    pub fn new(base_dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[must_use]
    pub fn document_dir(&self, document: &str) -> PathBuf {
        self.base_dir.join(storage_key(document))
    }

    /// Deterministic location of a page, whether or not it exists yet.
    #[must_use]
    pub fn page_path(&self, document: &str, index: usize) -> PathBuf {
        self.document_dir(document)
            .join(format!("page_{index}.{PAGE_EXTENSION}"))
    }

    #[must_use]
    pub fn exists(&self, document: &str, index: usize) -> bool {
        self.page_path(document, index).is_file()
    }

    /// Describe an already persisted page without decoding its pixels.
    pub fn record(&self, document: &str, index: usize) -> Result<Option<PageRecord>> {
        let path = self.page_path(document, index);
        let metadata = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (width_px, height_px) =
            image::image_dimensions(&path).map_err(|source| RenderError::Decode {
                path: path.clone(),
                source,
            })?;

        Ok(Some(PageRecord {
            index,
            path,
            byte_size: metadata.len(),
            width_px,
            height_px,
        }))
    }

    /// Encode and persist a page.
    ///
    /// The image is written to a temporary file in the document directory and
    /// renamed into place, so a page path either holds a complete image or
    /// does not exist. If another writer got there first its file is kept.
    pub fn write(&self, document: &str, index: usize, image: &PageImage) -> Result<PageRecord> {
        let dir = self.document_dir(document);
        let path = self.page_path(document, index);
        let disk_err = |source: io::Error| RenderError::DiskWrite {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&dir).map_err(disk_err)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".page_")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(disk_err)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let encoder = PngEncoder::new_with_quality(
                &mut writer,
                CompressionType::Fast,
                FilterType::Adaptive,
            );
            image
                .write_with_encoder(encoder)
                .map_err(|source| RenderError::Encode {
                    path: path.clone(),
                    source,
                })?;
            writer.flush().map_err(disk_err)?;
        }

        let byte_size = tmp.as_file().metadata().map_err(disk_err)?.len();
        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!("Wrote {path:?} ({byte_size} bytes)");
            }
            Err(e) if path.is_file() => {
                debug!("Page {path:?} already written by another render: {}", e.error);
                return self
                    .record(document, index)?
                    .ok_or_else(|| disk_err(e.error));
            }
            Err(e) => return Err(disk_err(e.error)),
        }

        Ok(PageRecord {
            index,
            path,
            byte_size,
            width_px: image.width(),
            height_px: image.height(),
        })
    }

    /// Decode a persisted page.
    pub fn read(&self, path: &Path) -> Result<PageImage> {
        let image = image::open(path).map_err(|source| RenderError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(image.into_rgb8())
    }

    /// Move a document's pages out of the store in one rename.
    ///
    /// The page paths are free for a new session as soon as this returns;
    /// the files themselves are deleted by [`DetachedPages::remove`].
    pub fn detach_document(&self, document: &str) -> io::Result<Option<DetachedPages>> {
        let dir = self.document_dir(document);
        if !dir.is_dir() {
            return Ok(None);
        }
        let trash = tempfile::Builder::new()
            .prefix(TRASH_PREFIX)
            .tempdir_in(&self.base_dir)?;
        match fs::rename(&dir, trash.path().join("pages")) {
            Ok(()) => Ok(Some(DetachedPages {
                document: document.to_string(),
                trash,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                warn!("Failed to detach {dir:?}: {e}");
                Err(e)
            }
        }
    }

    /// Remove every page of a document.
    pub fn clear_document(&self, document: &str) -> io::Result<()> {
        match self.detach_document(document)? {
            Some(detached) => detached.remove(),
            None => Ok(()),
        }
    }

    /// Number of complete pages currently stored for a document.
    #[must_use]
    pub fn stored_pages(&self, document: &str) -> usize {
        let Ok(entries) = fs::read_dir(self.document_dir(document)) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|entry| {
                let path = entry.path();
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(PAGE_EXTENSION)
            })
            .count()
    }
}

/// Directory and file stem for a document: its readable name plus a digest
/// of the raw name, so names that sanitize alike stay apart.
pub(crate) fn storage_key(document: &str) -> String {
    let digest = md5::compute(document.as_bytes());
    let hash_prefix = &format!("{digest:x}")[..12];
    format!("{}-{hash_prefix}", sanitize_filename(document))
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}
