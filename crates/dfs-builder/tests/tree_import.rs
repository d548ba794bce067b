#![forbid(unsafe_code)]

use dfs_builder::{Algorithm, Builder, BuilderConfig, CategoryCompression, CompressionSpec};
use dfs_error::DfsError;
use dfs_meta::MetadataStore;
use dfs_ondisk::{ImageHeader, MetadataImage};
use dfs_types::{FileKind, S_IPERM};
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;

fn config() -> BuilderConfig {
    BuilderConfig {
        block_size: 8192,
        dedup_window: 2048,
        worker_count: 2,
        compression: CategoryCompression::uniform(CompressionSpec::new(Algorithm::Zstd, Some(3))),
        ..BuilderConfig::default()
    }
}

fn load(image: &[u8]) -> MetadataStore {
    let header = ImageHeader::parse(image).expect("header");
    let start = usize::try_from(header.metadata_offset).expect("offset");
    let end = start + usize::try_from(header.metadata_len).expect("len");
    assert_eq!(crc32c::crc32c(&image[start..end]), header.metadata_checksum);
    let metadata = MetadataImage::parse(&image[start..end]).expect("metadata");
    MetadataStore::load(metadata, header.blocks_len).expect("valid metadata")
}

fn populate(root: &Path) {
    fs::create_dir_all(root.join("docs/nested")).expect("dirs");
    fs::create_dir(root.join("empty")).expect("empty dir");
    fs::write(root.join("docs/readme.txt"), "read me\n".repeat(500)).expect("readme");
    fs::write(root.join("docs/nested/copy.txt"), "read me\n".repeat(500)).expect("copy");
    let blob: Vec<u8> = (0..20_000_u32).map(|i| (i * 31 % 253) as u8).collect();
    fs::write(root.join("blob.bin"), blob).expect("blob");
    fs::write(root.join("zero"), b"").expect("zero");
    fs::set_permissions(root.join("blob.bin"), fs::Permissions::from_mode(0o600)).expect("chmod");
    symlink("docs/readme.txt", root.join("link")).expect("symlink");
}

#[test]
fn host_tree_round_trips_into_valid_metadata() {
    let src = tempfile::tempdir().expect("src");
    populate(src.path());

    let mut builder = Builder::new(config()).expect("builder");
    builder.add_tree(src.path()).expect("scan");
    let (image, stats) = builder.finalize_with_stats().expect("finalize");
    let store = load(&image);

    let paths: Vec<String> = store
        .walk()
        .expect("walk")
        .iter()
        .map(|e| e.path_str())
        .collect();
    assert_eq!(
        paths,
        vec![
            "/",
            "/blob.bin",
            "/docs",
            "/docs/nested",
            "/docs/nested/copy.txt",
            "/docs/readme.txt",
            "/empty",
            "/link",
            "/zero",
        ]
    );

    let blob = store.resolve("/blob.bin").expect("blob");
    let inode = store.inode(blob).expect("inode");
    assert_eq!(inode.mode & S_IPERM, 0o600);
    assert_eq!(inode.size, 20_000);

    let link = store.resolve_nofollow("/link").expect("link");
    assert_eq!(store.inode(link).expect("inode").kind, FileKind::Symlink);
    assert_eq!(store.readlink(link).expect("target"), b"docs/readme.txt");
    let readme_ino = store.resolve("/docs/readme.txt").expect("readme");
    assert_eq!(store.resolve("/link").expect("follow"), readme_ino);

    let readme = store.get_chunks(readme_ino).expect("chunks");
    let copy = store
        .get_chunks(store.resolve("/docs/nested/copy.txt").expect("c"))
        .expect("chunks");
    assert_eq!(readme, copy);
    assert!(stats.dedup_bytes >= 4000);
    assert_eq!(stats.files, 4);
    assert_eq!(stats.directories, 4);
    assert_eq!(stats.symlinks, 1);
}

#[test]
fn finalize_to_path_writes_the_whole_image() {
    let out = tempfile::tempdir().expect("out");
    let target = out.path().join("image.dfs");

    let mut builder = Builder::new(config()).expect("builder");
    builder.add_file("hello.txt", &b"hello world"[..]).expect("add");
    let stats = builder.finalize_to_path(&target).expect("write");

    let bytes = fs::read(&target).expect("read back");
    assert_eq!(bytes.len() as u64, stats.image_bytes);
    let store = load(&bytes);
    assert_eq!(store.inode_count(), 2);
    let leftovers: Vec<_> = fs::read_dir(out.path()).expect("ls").collect();
    assert_eq!(leftovers.len(), 1);
}

struct BrokenReader;

impl Read for BrokenReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "unreadable"))
    }
}

#[test]
fn failed_build_leaves_no_output() {
    let out = tempfile::tempdir().expect("out");
    let target = out.path().join("image.dfs");

    let mut builder = Builder::new(config()).expect("builder");
    builder.add_file("fine", &b"fine"[..]).expect("fine");
    assert!(builder.add_file("broken", BrokenReader).is_err());
    let err = builder.finalize_to_path(&target).expect_err("aborted");
    assert!(matches!(err, DfsError::Cancelled), "{err:?}");
    assert!(!target.exists());
    assert_eq!(fs::read_dir(out.path()).expect("ls").count(), 0);
}

#[test]
fn scanning_a_file_is_not_a_directory() {
    let src = tempfile::tempdir().expect("src");
    let file = src.path().join("plain");
    fs::write(&file, b"x").expect("write");
    let mut builder = Builder::new(config()).expect("builder");
    assert!(matches!(builder.add_tree(&file), Err(DfsError::NotDirectory)));
}
