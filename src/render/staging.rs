//! Copy document sources into random-access files the codec can open

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::disk::storage_key;
use super::request::{RenderError, Result};
use super::types::{Document, DocumentSource};

const DEFAULT_EXTENSION: &str = "pdf";

#[derive(Clone, Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[must_use]
    pub fn staged_path(&self, document: &Document) -> PathBuf {
        let extension = match &document.source {
            DocumentSource::Path(path) => path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or(DEFAULT_EXTENSION),
            DocumentSource::Bytes(_) => DEFAULT_EXTENSION,
        };
        self.dir
            .join(format!("{}.{extension}", storage_key(&document.name)))
    }

    /// Delete every staged copy of the named document, whatever its extension.
    pub fn remove(&self, document: &str) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let key = storage_key(document);
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && path.file_stem().and_then(|s| s.to_str()) == Some(key.as_str()) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!("Failed to remove staged {path:?}: {e}");
                        return Err(e);
                    }
                }
            }
        }
        if removed > 0 {
            debug!("Removed staged copy of {document}");
        }
        Ok(removed)
    }

    /// Copy the document's bytes to its staged path, replacing any previous copy.
    pub fn stage(&self, document: &Document) -> Result<PathBuf> {
        let target = self.staged_path(document);
        self.copy_into(document, &target)
            .map_err(|e| RenderError::unavailable(&document.name, e))?;
        debug!("Staged {} at {target:?}", document.name);
        Ok(target)
    }

    fn copy_into(&self, document: &Document, target: &Path) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".staging_")
            .tempfile_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            match &document.source {
                DocumentSource::Path(path) => {
                    let mut input = File::open(path)?;
                    io::copy(&mut input, &mut writer)?;
                }
                DocumentSource::Bytes(bytes) => writer.write_all(bytes)?,
            }
            writer.flush()?;
        }
        tmp.persist(target).map_err(|e| e.error)?;
        Ok(())
    }
}
