use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::warn;
use walkdir::WalkDir;

/// Packs a directory into a single archive file and back. Blocking; callers
/// run it off the async executor.
pub trait ArchiveCodec: Send + Sync {
    /// Writes the contents of `source` (not `source` itself) to `archive`.
    fn pack(&self, source: &Path, archive: &Path) -> io::Result<()>;

    fn unpack(&self, archive: &Path, dest: &Path) -> io::Result<()>;

    /// Reads one root-relative entry without unpacking the whole archive.
    fn read_entry(&self, archive: &Path, entry: &str) -> io::Result<Option<Vec<u8>>>;
}

/// gzip-compressed tar.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarGzCodec;

impl ArchiveCodec for TarGzCodec {
    fn pack(&self, source: &Path, archive: &Path) -> io::Result<()> {
        let file = File::create(archive)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut children: Vec<_> = fs::read_dir(source)?.collect::<io::Result<_>>()?;
        children.sort_by_key(|e| e.file_name());
        for child in children {
            let name = child.file_name();
            if child.file_type()?.is_dir() {
                builder.append_dir_all(&name, child.path())?;
            } else {
                builder.append_path_with_name(child.path(), &name)?;
            }
        }

        let file = builder
            .into_inner()?
            .finish()?
            .into_inner()
            .map_err(|e| e.into_error())?;
        file.sync_all()
    }

    fn unpack(&self, archive: &Path, dest: &Path) -> io::Result<()> {
        let decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
        tar::Archive::new(decoder).unpack(dest)
    }

    fn read_entry(&self, archive: &Path, entry: &str) -> io::Result<Option<Vec<u8>>> {
        let decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
        let mut archive = tar::Archive::new(decoder);
        let wanted = Path::new(entry);

        for item in archive.entries()? {
            let mut item = item?;
            if normalized(&item.path()?) == wanted {
                let mut buf = Vec::new();
                item.read_to_end(&mut buf)?;
                return Ok(Some(buf));
            }
        }
        Ok(None)
    }
}

fn normalized(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Copies the tree under `src` onto `dst`, creating directories as needed and
/// overwriting files that already exist. Symlinks are copied as links;
/// sockets, pipes and device nodes are skipped. Returns the number of files
/// copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if !file_type.is_file() && !file_type.is_symlink() {
            warn!(path = %entry.path().display(), "skipping special file");
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
        copied += 1;
    }
    Ok(copied)
}
