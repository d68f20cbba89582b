use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use super::header::TypeFlag;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
}

impl EntryKind {
    /// `None` for file types a tar archive cannot carry (sockets).
    pub fn from_file_type(file_type: fs::FileType) -> Option<Self> {
        if file_type.is_file() {
            Some(Self::Regular)
        } else if file_type.is_dir() {
            Some(Self::Directory)
        } else if file_type.is_symlink() {
            Some(Self::Symlink)
        } else if file_type.is_char_device() {
            Some(Self::CharDevice)
        } else if file_type.is_block_device() {
            Some(Self::BlockDevice)
        } else if file_type.is_fifo() {
            Some(Self::Fifo)
        } else {
            None
        }
    }

    pub fn type_flag(self) -> TypeFlag {
        match self {
            Self::Regular => TypeFlag::Regular,
            Self::Directory => TypeFlag::Directory,
            Self::Symlink => TypeFlag::Symlink,
            Self::CharDevice => TypeFlag::CharDevice,
            Self::BlockDevice => TypeFlag::BlockDevice,
            Self::Fifo => TypeFlag::Fifo,
        }
    }
}

/// Metadata of one filesystem object as it will be written to the archive.
#[derive(Clone, Debug)]
pub struct TarEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Payload length; only regular files carry one.
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub user_name: String,
    pub group_name: String,
    pub dev_major: u64,
    pub dev_minor: u64,
    pub mtime: i64,
    pub link_target: Option<PathBuf>,
}

impl TarEntry {
    /// Builds an entry from `metadata`, which is the symlink's own metadata
    /// unless the caller followed it.
    pub fn from_metadata(path: &Path, metadata: &Metadata) -> Result<Option<Self>> {
        let Some(kind) = EntryKind::from_file_type(metadata.file_type()) else {
            return Ok(None);
        };

        let link_target = match kind {
            EntryKind::Symlink => Some(fs::read_link(path).map_err(|source| Error::Source {
                path: path.to_path_buf(),
                source,
            })?),
            _ => None,
        };
        let (dev_major, dev_minor) = match kind {
            EntryKind::CharDevice | EntryKind::BlockDevice => {
                let rdev = metadata.rdev();
                (
                    u64::from(nix::sys::stat::major(rdev)),
                    u64::from(nix::sys::stat::minor(rdev)),
                )
            }
            _ => (0, 0),
        };

        Ok(Some(Self {
            path: path.to_path_buf(),
            kind,
            size: if kind == EntryKind::Regular {
                metadata.len()
            } else {
                0
            },
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid().into(),
            gid: metadata.gid().into(),
            user_name: String::new(),
            group_name: String::new(),
            dev_major,
            dev_minor,
            mtime: metadata.mtime(),
            link_target,
        }))
    }

    pub fn has_payload(&self) -> bool {
        self.kind == EntryKind::Regular
    }
}

/// Lexically normalized components of an absolute path: `.` segments dropped,
/// `..` popping the previous component but never climbing above `/`.
pub(crate) fn normalize(path: &Path) -> Result<Vec<String>> {
    if !path.is_absolute() {
        return Err(Error::format(path, "path should be absolute"));
    }
    let text = path
        .to_str()
        .ok_or_else(|| Error::format(path, "path is not valid UTF-8"))?;

    let mut parts: Vec<String> = Vec::new();
    for segment in text.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other.to_string()),
        }
    }
    Ok(parts)
}

pub(crate) fn join_absolute(parts: &[String]) -> PathBuf {
    let mut path = PathBuf::from("/");
    path.extend(parts);
    path
}

/// Member name for an entry whose normalized components are `parts`.
///
/// Below an archive root the name is `./relative`; without one the leading
/// `/` is dropped. Directory names end with `/`.
pub(crate) fn member_name(
    parts: &[String],
    root: Option<&[String]>,
    directory: bool,
    original: &Path,
) -> Result<String> {
    let mut name = match root {
        Some(root) => {
            if !parts.starts_with(root) {
                return Err(Error::format(original, "path is outside of the archive root"));
            }
            let relative = &parts[root.len()..];
            if relative.is_empty() {
                ".".to_string()
            } else {
                format!("./{}", relative.join("/"))
            }
        }
        None if parts.is_empty() => ".".to_string(),
        None => parts.join("/"),
    };

    if directory {
        name.push('/');
    }
    Ok(name)
}

/// Text of a symlink target as stored in the header.
pub(crate) fn link_text(target: &Path) -> Result<String> {
    target
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| Error::format(target, "symlink target is not valid UTF-8"))
}

pub(crate) fn stat(path: &Path, follow_symlinks: bool) -> io::Result<Metadata> {
    if follow_symlinks {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    }
}
