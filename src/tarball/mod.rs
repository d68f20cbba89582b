//! Streaming GNU tar writer.

pub mod entry;
pub mod header;

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use nix::unistd::{Gid, Group, Uid, User};

pub use self::entry::{EntryKind, TarEntry};
pub use self::header::{BLOCK_SIZE, Header, TypeFlag};

use self::entry::{join_absolute, link_text, member_name, normalize, stat};
use self::header::{LINK_NAME_LEN, NAME_LEN, padding};
use crate::events::{EntryObserver, LogLevel, LogSink, tracing_sink};
use crate::{Error, Result};

const COPY_BUFFER_SIZE: usize = 1 << 20;
const ZERO_BLOCK: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

/// Caches uid/gid to name lookups for the lifetime of one writer.
#[derive(Default)]
struct OwnerNames {
    users: HashMap<u64, String>,
    groups: HashMap<u64, String>,
}

impl OwnerNames {
    fn user(&mut self, uid: u64) -> String {
        self.users
            .entry(uid)
            .or_insert_with(|| {
                u32::try_from(uid)
                    .ok()
                    .and_then(|uid| User::from_uid(Uid::from_raw(uid)).ok().flatten())
                    .map(|user| user.name)
                    .unwrap_or_default()
            })
            .clone()
    }

    fn group(&mut self, gid: u64) -> String {
        self.groups
            .entry(gid)
            .or_insert_with(|| {
                u32::try_from(gid)
                    .ok()
                    .and_then(|gid| Group::from_gid(Gid::from_raw(gid)).ok().flatten())
                    .map(|group| group.name)
                    .unwrap_or_default()
            })
            .clone()
    }
}

/// Writes filesystem entries as a GNU tar stream into `W`.
///
/// Entries are emitted in call order. Every ancestor directory between the
/// archive root and an entry is written once, before the first entry that
/// needs it. The stream is only a complete archive after [`finish`].
///
/// [`finish`]: TarWriter::finish
pub struct TarWriter<W: Write> {
    inner: W,
    root: Option<Vec<String>>,
    follow_symlinks: bool,
    archived_dirs: HashSet<Vec<String>>,
    owners: OwnerNames,
    observer: Option<EntryObserver>,
    log: LogSink,
    copy_buf: Vec<u8>,
}

impl<W: Write> TarWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            root: None,
            follow_symlinks: false,
            archived_dirs: HashSet::new(),
            owners: OwnerNames::default(),
            observer: None,
            log: tracing_sink(),
            copy_buf: Vec::new(),
        }
    }

    /// Archive names become `./relative` paths below `root`.
    pub fn with_root(mut self, root: &Path) -> Result<Self> {
        self.root = Some(normalize(root)?);
        Ok(self)
    }

    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn on_entry(mut self, observer: EntryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn log_sink(mut self, log: LogSink) -> Self {
        self.log = log;
        self
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Archives `path`, which must be absolute.
    pub fn add_entry(&mut self, path: &Path) -> Result<()> {
        let parts = normalize(path)?;
        if let Some(root) = &self.root {
            if !parts.starts_with(root) {
                return Err(Error::format(path, "path is outside of the archive root"));
            }
        }

        let Some(entry) = self.stat_entry(path)? else {
            (self.log)(
                LogLevel::Warning,
                &format!("skipping {}: unsupported file type", path.display()),
            );
            return Ok(());
        };

        if entry.kind == EntryKind::Directory {
            return self.ensure_directories(&parts);
        }

        self.ensure_directories(&parts[..parts.len().saturating_sub(1)])?;
        let name = member_name(&parts, self.root.as_deref(), false, path)?;
        self.write_entry(entry, &name)?;
        if let Some(observer) = self.observer.as_mut() {
            observer(&name);
        }
        Ok(())
    }

    /// Writes the end-of-archive marker and hands back the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.inner.write_all(&ZERO_BLOCK)?;
        self.inner.write_all(&ZERO_BLOCK)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn stat_entry(&self, path: &Path) -> Result<Option<TarEntry>> {
        let source = |source| Error::Source {
            path: path.to_path_buf(),
            source,
        };

        let metadata = match stat(path, self.follow_symlinks) {
            Ok(metadata) => metadata,
            Err(err) if self.follow_symlinks && err.kind() == io::ErrorKind::NotFound => {
                // Dangling symlink: archive the link itself.
                let metadata = fs::symlink_metadata(path).map_err(source)?;
                (self.log)(
                    LogLevel::Warning,
                    &format!("{}: symlink target is missing", path.display()),
                );
                metadata
            }
            Err(err) => return Err(source(err)),
        };
        TarEntry::from_metadata(path, &metadata)
    }

    fn ensure_directories(&mut self, parts: &[String]) -> Result<()> {
        // The filesystem root itself is never an entry without an archive root.
        let first = self.root.as_ref().map_or(1, Vec::len);
        for depth in first..=parts.len() {
            let prefix = &parts[..depth];
            if self.archived_dirs.contains(prefix) {
                continue;
            }

            let path = join_absolute(prefix);
            let metadata = fs::metadata(&path).map_err(|source| Error::Source {
                path: path.clone(),
                source,
            })?;
            let Some(mut entry) = TarEntry::from_metadata(&path, &metadata)? else {
                return Err(Error::format(&path, "ancestor is not a directory"));
            };
            entry.kind = EntryKind::Directory;
            entry.size = 0;

            let name = member_name(prefix, self.root.as_deref(), true, &path)?;
            self.write_entry(entry, &name)?;
            self.archived_dirs.insert(prefix.to_vec());
        }
        Ok(())
    }

    fn write_entry(&mut self, mut entry: TarEntry, name: &str) -> Result<()> {
        if name.contains('\0') {
            return Err(Error::format(&entry.path, "name contains a NUL byte"));
        }
        let link_name = match &entry.link_target {
            Some(target) => link_text(target)?,
            None => String::new(),
        };
        if link_name.contains('\0') {
            return Err(Error::format(&entry.path, "link target contains a NUL byte"));
        }

        entry.user_name = self.owners.user(entry.uid);
        entry.group_name = self.owners.group(entry.gid);

        if name.len() > NAME_LEN {
            self.write_long_record(TypeFlag::LongName, name)?;
        }
        if link_name.len() > LINK_NAME_LEN {
            self.write_long_record(TypeFlag::LongLink, &link_name)?;
        }

        let header = Header {
            name: name.to_string(),
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            size: entry.size,
            mtime: entry.mtime,
            type_flag: entry.kind.type_flag(),
            link_name,
            user_name: entry.user_name,
            group_name: entry.group_name,
            dev_major: entry.dev_major,
            dev_minor: entry.dev_minor,
        };
        self.inner.write_all(&header.encode()?)?;

        if entry.kind == EntryKind::Regular {
            let mut file = File::open(&entry.path).map_err(|source| Error::Source {
                path: entry.path.clone(),
                source,
            })?;
            self.copy_payload(&mut file, entry.size, &entry.path)?;
        }
        Ok(())
    }

    /// GNU `L`/`K` record: header, the NUL-terminated string, padding.
    fn write_long_record(&mut self, type_flag: TypeFlag, value: &str) -> Result<()> {
        let len = value.len() + 1;
        self.inner
            .write_all(&Header::long_record(type_flag, len).encode()?)?;
        self.inner.write_all(value.as_bytes())?;
        self.inner.write_all(&[0])?;
        self.inner.write_all(&ZERO_BLOCK[..padding(len as u64)])?;
        Ok(())
    }

    /// Copies exactly `size` bytes of `reader`, zero-filling when the source
    /// ends early, then pads to the block boundary.
    fn copy_payload(&mut self, reader: &mut impl Read, size: u64, path: &Path) -> Result<()> {
        if self.copy_buf.is_empty() {
            self.copy_buf = vec![0u8; COPY_BUFFER_SIZE];
        }

        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(self.copy_buf.len() as u64) as usize;
            let read = match reader.read(&mut self.copy_buf[..want]) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(Error::Source {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            };
            self.inner.write_all(&self.copy_buf[..read])?;
            remaining -= read as u64;
        }

        if remaining > 0 {
            (self.log)(
                LogLevel::Warning,
                &format!(
                    "{}: file shrank by {remaining} bytes while archiving, padding with zeros",
                    path.display()
                ),
            );
            while remaining > 0 {
                let chunk = remaining.min(BLOCK_SIZE as u64) as usize;
                self.inner.write_all(&ZERO_BLOCK[..chunk])?;
                remaining -= chunk as u64;
            }
        }

        self.inner.write_all(&ZERO_BLOCK[..padding(size)])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::null_sink;
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    struct Listing {
        name: String,
        kind: tar::EntryType,
        link: Option<String>,
        data: Vec<u8>,
    }

    fn list(archive: &[u8]) -> Vec<Listing> {
        let mut archive = tar::Archive::new(archive);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = String::from_utf8(entry.path_bytes().into_owned()).unwrap();
                let link = entry
                    .link_name_bytes()
                    .map(|bytes| String::from_utf8(bytes.into_owned()).unwrap());
                let kind = entry.header().entry_type();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                Listing {
                    name,
                    kind,
                    link,
                    data,
                }
            })
            .collect()
    }

    fn rooted(root: &Path) -> TarWriter<Vec<u8>> {
        TarWriter::new(Vec::new())
            .with_root(root)
            .unwrap()
            .log_sink(null_sink())
    }

    #[test]
    fn parent_directories_are_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("c"), b"c").unwrap();
        fs::write(nested.join("d"), b"dd").unwrap();

        let mut writer = rooted(dir.path());
        writer.add_entry(&nested.join("d")).unwrap();
        writer.add_entry(&nested.join("c")).unwrap();
        writer.add_entry(&nested).unwrap();
        let archive = writer.finish().unwrap();

        let names: Vec<_> = list(&archive).into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["./", "./a/", "./a/b/", "./a/b/d", "./a/b/c"]);
    }

    #[test]
    fn payload_is_padded_to_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..700u32).map(|i| (i % 256) as u8).collect();
        fs::write(dir.path().join("data.bin"), &data).unwrap();
        fs::write(dir.path().join("empty"), b"").unwrap();

        let mut writer = rooted(dir.path());
        writer.add_entry(&dir.path().join("data.bin")).unwrap();
        writer.add_entry(&dir.path().join("empty")).unwrap();
        let archive = writer.finish().unwrap();

        // root dir, header + 2 payload blocks, empty file header, end marker
        assert_eq!(archive.len(), BLOCK_SIZE * (1 + 3 + 1 + 2));
        assert!(archive[archive.len() - 2 * BLOCK_SIZE..].iter().all(|&b| b == 0));

        let entries = list(&archive);
        assert_eq!(entries[1].name, "./data.bin");
        assert_eq!(entries[1].data, data);
        assert!(entries[2].data.is_empty());
    }

    #[test]
    fn long_names_use_gnu_records() {
        let dir = tempfile::tempdir().unwrap();
        let long = "x".repeat(150);
        let path = dir.path().join(&long);
        fs::write(&path, b"payload").unwrap();

        let mut writer = rooted(dir.path());
        writer.add_entry(&path).unwrap();
        let archive = writer.finish().unwrap();

        let record = &archive[BLOCK_SIZE..2 * BLOCK_SIZE];
        assert_eq!(&record[..13], b"././@LongLink");
        assert_eq!(record[156], b'L');
        assert!(header::tests::checksum_is_valid(record));

        let payload = &archive[2 * BLOCK_SIZE..3 * BLOCK_SIZE];
        let expected = format!("./{long}\0");
        assert_eq!(&payload[..expected.len()], expected.as_bytes());

        let entries = list(&archive);
        assert_eq!(entries[1].name, format!("./{long}"));
        assert_eq!(entries[1].data, b"payload");
    }

    #[test]
    fn symlinks_keep_long_targets() {
        let dir = tempfile::tempdir().unwrap();
        let target = format!("/nonexistent/{}", "t".repeat(120));
        let link = dir.path().join("link");
        symlink(&target, &link).unwrap();

        let mut writer = rooted(dir.path());
        writer.add_entry(&link).unwrap();
        let archive = writer.finish().unwrap();

        let entries = list(&archive);
        assert_eq!(entries[1].name, "./link");
        assert_eq!(entries[1].kind, tar::EntryType::Symlink);
        assert_eq!(entries[1].link.as_deref(), Some(target.as_str()));
        assert!(entries[1].data.is_empty());
    }

    #[test]
    fn followed_symlinks_archive_the_target() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real"), b"contents").unwrap();
        symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();
        symlink(dir.path().join("missing"), dir.path().join("dangling")).unwrap();

        let warnings = Arc::new(Mutex::new(Vec::new()));
        let log: LogSink = {
            let warnings = warnings.clone();
            Arc::new(move |level: LogLevel, message: &str| {
                warnings.lock().unwrap().push((level, message.to_string()));
            })
        };
        let mut writer = rooted(dir.path()).follow_symlinks(true).log_sink(log);
        writer.add_entry(&dir.path().join("alias")).unwrap();
        writer.add_entry(&dir.path().join("dangling")).unwrap();
        let archive = writer.finish().unwrap();

        let entries = list(&archive);
        assert_eq!(entries[1].kind, tar::EntryType::Regular);
        assert_eq!(entries[1].data, b"contents");
        assert_eq!(entries[2].kind, tar::EntryType::Symlink);

        let warnings = warnings.lock().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0, LogLevel::Warning);
    }

    #[test]
    fn observer_sees_only_non_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/file"), b"1").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: EntryObserver = {
            let seen = seen.clone();
            Box::new(move |name: &str| seen.lock().unwrap().push(name.to_string()))
        };
        let mut writer = rooted(dir.path()).on_entry(observer);
        writer.add_entry(&dir.path().join("sub")).unwrap();
        writer.add_entry(&dir.path().join("sub/file")).unwrap();
        writer.finish().unwrap();

        assert_eq!(*seen.lock().unwrap(), ["./sub/file"]);
    }

    #[test]
    fn names_without_root_are_relative() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();

        let mut writer = TarWriter::new(Vec::new()).log_sink(null_sink());
        writer.add_entry(&file).unwrap();
        let archive = writer.finish().unwrap();

        let entries = list(&archive);
        let expected = file.to_str().unwrap().trim_start_matches('/');
        assert_eq!(entries.last().unwrap().name, expected);
        let depth = normalize(dir.path()).unwrap().len();
        assert_eq!(entries.len(), depth + 1);
        assert!(entries.iter().all(|e| !e.name.starts_with('/')));
    }

    #[test]
    fn paths_outside_root_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        fs::write(other.path().join("f"), b"").unwrap();

        let mut writer = rooted(root.path());
        let err = writer.add_entry(&other.path().join("f")).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
        assert!(matches!(
            writer.add_entry(&PathBuf::from("relative")),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn missing_source_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = rooted(dir.path());
        match writer.add_entry(&dir.path().join("gone")) {
            Err(Error::Source { path, source }) => {
                assert!(path.ends_with("gone"));
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn shrunk_source_is_zero_filled() {
        let warnings = Arc::new(Mutex::new(0usize));
        let log: LogSink = {
            let warnings = warnings.clone();
            Arc::new(move |_: LogLevel, _: &str| *warnings.lock().unwrap() += 1)
        };
        let mut writer = TarWriter::new(Vec::new()).log_sink(log);
        let mut short: &[u8] = b"only-twelve!";
        writer
            .copy_payload(&mut short, 600, Path::new("/tmp/shrunk"))
            .unwrap();

        let out = writer.get_ref();
        assert_eq!(out.len(), 2 * BLOCK_SIZE);
        assert_eq!(&out[..12], b"only-twelve!");
        assert!(out[12..].iter().all(|&b| b == 0));
        assert_eq!(*warnings.lock().unwrap(), 1);
    }

    #[test]
    fn grown_source_is_truncated_to_header_size() {
        let mut writer = TarWriter::new(Vec::new()).log_sink(null_sink());
        let mut long: &[u8] = &[9u8; 2000];
        writer
            .copy_payload(&mut long, 10, Path::new("/tmp/grown"))
            .unwrap();
        let out = writer.get_ref();
        assert_eq!(out.len(), BLOCK_SIZE);
        assert_eq!(&out[..10], &[9u8; 10]);
        assert!(out[10..].iter().all(|&b| b == 0));
    }
}
