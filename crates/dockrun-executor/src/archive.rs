//! Packs a project directory into a tar archive used as a build context.

use dockrun_core::{Error, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

/// Archive every file and directory under `src` into a tar file at `dest`.
///
/// Entry names are relative to `src` and the root itself is never an entry.
/// Directories are walked in name order so an unchanged tree always yields
/// the same entry sequence. Symlinks are stored as links.
///
/// On error any partially written `dest` is removed. Returns the archive
/// size in bytes.
pub fn create_archive(src: &Path, dest: &Path) -> Result<u64> {
    if !src.is_dir() {
        return Err(Error::Workspace(format!(
            "project directory does not exist: {}",
            src.display()
        )));
    }

    info!(src = %src.display(), dest = %dest.display(), "Creating archive");

    let file = File::create(dest)
        .map_err(|e| Error::ArchiveIo(format!("{}: {}", dest.display(), e)))?;

    match write_archive(src, dest, file) {
        Ok(size) => {
            info!(size, "Archive created");
            Ok(size)
        }
        Err(e) => {
            let _ = fs::remove_file(dest);
            Err(Error::ArchiveIo(format!("{}: {}", src.display(), e)))
        }
    }
}

fn write_archive(src: &Path, dest: &Path, file: File) -> io::Result<u64> {
    let mut builder = tar::Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);

    append_tree(&mut builder, src, Path::new(""), dest)?;

    let writer = builder.into_inner()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
    dest: &Path,
) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        // The archive may be written inside the tree it is reading.
        if path == dest {
            continue;
        }

        let name = prefix.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            builder.append_path_with_name(&path, &name)?;
            append_tree(builder, &path, &name, dest)?;
        } else if file_type.is_file() || file_type.is_symlink() {
            builder.append_path_with_name(&path, &name)?;
        } else {
            debug!(path = %path.display(), "Skipping special file");
        }
    }

    Ok(())
}
