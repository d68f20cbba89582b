use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tarflow::compress::{GzipOptions, XzOptions};
use tarflow::events::null_sink;
use tarflow::{ArchiveOptions, CodecOptions, CompressorKind, EntryObserver, feed_archive};
use walkdir::WalkDir;

const LONG_DIR: &str = "a-directory-name-that-is-long-enough/to-push-the-member-name/\
                        past-the-hundred-byte-header-field";

struct Fixture {
    dir: tempfile::TempDir,
    payload: Vec<u8>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join(LONG_DIR)).unwrap();
        fs::create_dir(root.join("empty")).unwrap();
        fs::write(root.join("src/lib.txt"), b"library sources\n").unwrap();
        fs::write(root.join(LONG_DIR).join("deep.txt"), b"deep").unwrap();

        // Compressible but not trivially so.
        let payload: Vec<u8> = (0..600_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8 % 16 + b'a')
            .collect();
        fs::write(root.join("payload.bin"), &payload).unwrap();
        std::os::unix::fs::symlink("src/lib.txt", root.join("link")).unwrap();

        Self { dir, payload }
    }

    fn files(&self) -> Vec<PathBuf> {
        WalkDir::new(self.dir.path())
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .map(|entry| entry.unwrap().into_path())
            .collect()
    }

    fn options(&self, codecs: Vec<CodecOptions>) -> ArchiveOptions {
        ArchiveOptions {
            root: Some(self.dir.path().to_path_buf()),
            codecs,
            buffer_size: 64 * 1024,
            ..ArchiveOptions::default()
        }
    }

    fn archive(&self, codecs: Vec<CodecOptions>) -> Vec<u8> {
        let mut bridge =
            feed_archive(self.files(), self.options(codecs), None, null_sink()).unwrap();
        let mut out = Vec::new();
        bridge.read_to_end(&mut out).unwrap();
        bridge.close();
        out
    }
}

#[derive(Debug, PartialEq)]
enum Member {
    Dir,
    File(Vec<u8>),
    Link(String),
}

fn members(tar_bytes: &[u8]) -> BTreeMap<String, Member> {
    let mut archive = tar::Archive::new(tar_bytes);
    let mut members = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = String::from_utf8(entry.path_bytes().into_owned()).unwrap();
        let member = match entry.header().entry_type() {
            tar::EntryType::Directory => Member::Dir,
            tar::EntryType::Symlink => {
                let target = entry.link_name().unwrap().unwrap();
                Member::Link(target.to_string_lossy().into_owned())
            }
            _ => {
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                Member::File(data)
            }
        };
        assert!(members.insert(name, member).is_none());
    }
    members
}

fn check_members(fixture: &Fixture, tar_bytes: &[u8]) {
    let members = members(tar_bytes);
    assert_eq!(members["./"], Member::Dir);
    assert_eq!(members["./empty/"], Member::Dir);
    assert_eq!(members["./src/"], Member::Dir);
    assert_eq!(members["./src/lib.txt"], Member::File(b"library sources\n".to_vec()));
    assert_eq!(members["./link"], Member::Link("src/lib.txt".into()));
    assert_eq!(members["./payload.bin"], Member::File(fixture.payload.clone()));

    let deep = format!("./{LONG_DIR}/deep.txt");
    assert!(deep.len() > 100);
    assert_eq!(members[deep.as_str()], Member::File(b"deep".to_vec()));
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

#[test]
fn plain_tar_contains_every_member() {
    let fixture = Fixture::new();
    let tar_bytes = fixture.archive(Vec::new());
    assert_eq!(tar_bytes.len() % 512, 0);
    assert!(tar_bytes[tar_bytes.len() - 1024..].iter().all(|&b| b == 0));
    check_members(&fixture, &tar_bytes);
}

#[test]
fn gzip_archive_decodes() {
    let fixture = Fixture::new();
    let compressed = fixture.archive(vec![CodecOptions::default_for(CompressorKind::Gzip)]);
    assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
    check_members(&fixture, &gunzip(&compressed));
}

#[test]
fn parallel_gzip_matches_plain_tar() {
    let fixture = Fixture::new();
    let plain = fixture.archive(Vec::new());

    let gzip = GzipOptions::new(6)
        .unwrap()
        .with_threads(4)
        .unwrap()
        .with_chunk_size(32 * 1024)
        .unwrap();
    let compressed = fixture.archive(vec![CodecOptions::Gzip(gzip)]);

    // One gzip member, so a single-member decoder must read all of it.
    let decoded = gunzip(&compressed);
    assert_eq!(decoded, plain);
    check_members(&fixture, &decoded);
}

#[test]
fn bzip2_xz_and_zstd_archives_decode() {
    let fixture = Fixture::new();
    let plain = fixture.archive(Vec::new());

    let bz2 = fixture.archive(vec![CodecOptions::default_for(CompressorKind::Bzip2)]);
    let mut decoded = Vec::new();
    bzip2::read::BzDecoder::new(&bz2[..])
        .read_to_end(&mut decoded)
        .unwrap();
    assert_eq!(decoded, plain);

    let xz_options = XzOptions::new(1).unwrap().with_threads(2).unwrap();
    let xz = fixture.archive(vec![CodecOptions::Xz(xz_options)]);
    let mut decoded = Vec::new();
    xz2::read::XzDecoder::new(&xz[..])
        .read_to_end(&mut decoded)
        .unwrap();
    assert_eq!(decoded, plain);

    let zst = fixture.archive(vec![CodecOptions::default_for(CompressorKind::Zstd)]);
    assert_eq!(zstd::stream::decode_all(&zst[..]).unwrap(), plain);
}

#[test]
fn stacked_codecs_unwrap_outermost_last() {
    let fixture = Fixture::new();
    let plain = fixture.archive(Vec::new());

    let options = fixture.options(vec![
        CodecOptions::default_for(CompressorKind::Zstd),
        CodecOptions::default_for(CompressorKind::Gzip),
    ]);
    assert_eq!(options.extension(), ".tar.zst.gz");

    let compressed = fixture.archive(options.codecs.clone());
    let zst = gunzip(&compressed);
    assert_eq!(zstd::stream::decode_all(&zst[..]).unwrap(), plain);
}

#[test]
fn observer_sees_non_directory_members_in_order() {
    let fixture = Fixture::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer: EntryObserver = {
        let seen = seen.clone();
        Box::new(move |name: &str| seen.lock().unwrap().push(name.to_string()))
    };

    let mut bridge = feed_archive(
        fixture.files(),
        fixture.options(Vec::new()),
        Some(observer),
        null_sink(),
    )
    .unwrap();
    let mut out = Vec::new();
    bridge.read_to_end(&mut out).unwrap();
    bridge.close();

    let seen = seen.lock().unwrap();
    let mut expected = vec![
        format!("./{LONG_DIR}/deep.txt"),
        "./link".to_string(),
        "./payload.bin".to_string(),
        "./src/lib.txt".to_string(),
    ];
    expected.sort();
    assert_eq!(*seen, expected);
}

#[test]
fn dereferenced_symlink_is_archived_as_its_target() {
    let fixture = Fixture::new();
    let options = ArchiveOptions {
        follow_symlinks: true,
        ..fixture.options(Vec::new())
    };
    let link = fixture.dir.path().join("link");

    let mut bridge = feed_archive(vec![link], options, None, null_sink()).unwrap();
    let mut out = Vec::new();
    bridge.read_to_end(&mut out).unwrap();
    bridge.close();

    let members = members(&out);
    assert_eq!(members["./link"], Member::File(b"library sources\n".to_vec()));
    assert!(members.contains_key("./"));
}

#[test]
fn member_outside_the_root_fails_the_stream() {
    let fixture = Fixture::new();
    let other = tempfile::tempdir().unwrap();
    let stray = other.path().join("stray.txt");
    fs::write(&stray, b"stray").unwrap();

    let mut bridge =
        feed_archive(vec![stray], fixture.options(Vec::new()), None, null_sink()).unwrap();
    let mut out = Vec::new();
    let err = bridge.read_to_end(&mut out).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    assert!(bridge.failure().is_some());
    bridge.close();
}

#[test]
fn walk_order_is_what_the_archive_keeps() {
    let fixture = Fixture::new();
    let tar_bytes = fixture.archive(Vec::new());
    let mut archive = tar::Archive::new(&tar_bytes[..]);
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|entry| String::from_utf8(entry.unwrap().path_bytes().into_owned()).unwrap())
        .collect();

    let expected: Vec<String> = fixture
        .files()
        .iter()
        .map(|path| relative_name(fixture.dir.path(), path))
        .collect();
    assert_eq!(names, expected);
}

fn relative_name(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap();
    if rel.as_os_str().is_empty() {
        return "./".to_string();
    }
    let mut name = format!("./{}", rel.display());
    if fs::symlink_metadata(path).unwrap().is_dir() {
        name.push('/');
    }
    name
}
