//! Zip encoding of directory trees for transfer.

use std::fs::File;
use std::io::{self, Cursor};
use std::path::Path;

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::FileProviderError;

fn zip_error(e: zip::result::ZipError) -> FileProviderError {
    FileProviderError::Io(io::Error::other(e))
}

/// Archive every file and directory below `dir`, with paths relative to it.
pub fn zip_directory(dir: &Path) -> Result<Vec<u8>, FileProviderError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| FileProviderError::Io(io::Error::other(e)))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            writer.add_directory(name, options).map_err(zip_error)?;
        } else {
            writer.start_file(name, options).map_err(zip_error)?;
            let mut file = File::open(entry.path())?;
            io::copy(&mut file, &mut writer)?;
        }
    }

    let cursor = writer.finish().map_err(zip_error)?;
    Ok(cursor.into_inner())
}

/// Extract an archive produced by [`zip_directory`] into `target`.
pub fn unzip_into(bytes: &[u8], target: &Path) -> Result<(), FileProviderError> {
    std::fs::create_dir_all(target)?;
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)?;
    archive.extract(target).map_err(zip_error)
}
