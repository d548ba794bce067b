#![forbid(unsafe_code)]

use dfs_builder::{Algorithm, Builder, BuilderConfig, CategoryCompression, CompressionSpec, NodeAttrs};
use dfs_core::{CacheConfig, FsOps, Image, OpenOptions};
use dfs_error::DfsError;
use dfs_ondisk::ImageHeader;
use dfs_types::{FileKind, InodeNumber};
use std::ffi::OsStr;
use std::sync::{Arc, Barrier};

/// Deterministic pseudo-random bytes (SplitMix64).
fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        out.extend_from_slice(&(z ^ (z >> 31)).to_le_bytes());
    }
    out.truncate(len);
    out
}

fn build_config(algorithm: Algorithm) -> BuilderConfig {
    BuilderConfig {
        block_size: 4096,
        dedup_window: 1024,
        worker_count: 2,
        compression: CategoryCompression::uniform(CompressionSpec::new(algorithm, None)),
        ..BuilderConfig::default()
    }
}

struct Fixture {
    image: Vec<u8>,
    big: Vec<u8>,
}

fn fixture(algorithm: Algorithm) -> Fixture {
    let big = pseudo_random(50_000, 7);
    let mut builder = Builder::new(build_config(algorithm)).expect("builder");
    builder.add_file("a.txt", &b"hello world"[..]).expect("a");
    builder.add_file("b.txt", &b"hello world"[..]).expect("b");
    builder.add_file("data/big.bin", big.as_slice()).expect("big");
    builder.add_file("data/empty", &b""[..]).expect("empty");
    builder
        .add_symlink("data/link", "../a.txt", NodeAttrs::symlink())
        .expect("link");
    builder
        .add_special("data/fifo", FileKind::Fifo, 0, NodeAttrs::with_mode(0o600))
        .expect("fifo");
    Fixture {
        image: builder.finalize().expect("finalize"),
        big,
    }
}

fn mount(image: &[u8]) -> Image {
    Image::from_bytes(image.to_vec(), &OpenOptions::default()).expect("mount")
}

fn ino(image: &Image, path: &str) -> InodeNumber {
    image.lookup_path(path).expect("lookup").ino
}

#[test]
fn reads_whole_files_and_ranges() {
    let fx = fixture(Algorithm::Zstd);
    let image = mount(&fx.image);
    assert_eq!(image.read_path("/a.txt").expect("a"), b"hello world");
    assert_eq!(image.read_path("/data/big.bin").expect("big"), fx.big);
    assert_eq!(image.read_path("/data/link").expect("via link"), b"hello world");

    let a = ino(&image, "/a.txt");
    let b = ino(&image, "/b.txt");
    assert_eq!(image.read(a, 0, 5).expect("read"), b"hello");
    assert_eq!(image.read(b, 6, 5).expect("read"), b"world");

    let big = ino(&image, "/data/big.bin");
    let got = image.read_range(big, 4000, 9000).expect("range");
    assert_eq!(got, &fx.big[4000..13_000]);
}

#[test]
fn ranges_past_eof_are_short_reads() {
    let fx = fixture(Algorithm::Lz4);
    let image = mount(&fx.image);
    let a = ino(&image, "/a.txt");
    assert_eq!(image.read_range(a, 8, 10).expect("short"), b"rld");
    assert!(image.read_range(a, 11, 10).expect("at eof").is_empty());
    assert!(image.read_range(a, 500, 1).expect("past eof").is_empty());
    assert!(image.read_range(a, 0, 0).expect("zero").is_empty());

    let empty = ino(&image, "/data/empty");
    assert!(image.read_range(empty, 0, 100).expect("empty").is_empty());
}

#[test]
fn negative_arguments_are_invalid_ranges() {
    let fx = fixture(Algorithm::Lz4);
    let image = mount(&fx.image);
    let a = ino(&image, "/a.txt");
    assert!(matches!(
        image.read_range(a, -1, 4),
        Err(DfsError::InvalidRange { offset: -1, length: 4 })
    ));
    assert!(matches!(
        image.read_range(a, 0, -4),
        Err(DfsError::InvalidRange { .. })
    ));
    assert!(matches!(image.read(a, -10, 4), Err(DfsError::InvalidRange { .. })));
}

#[test]
fn reading_non_files_fails_with_typed_errors() {
    let fx = fixture(Algorithm::Lz4);
    let image = mount(&fx.image);
    assert!(matches!(
        image.read(InodeNumber::ROOT, 0, 10),
        Err(DfsError::IsDirectory)
    ));
    let fifo = image.lookup_path("/data/fifo").expect("fifo");
    assert_eq!(fifo.kind, FileKind::Fifo);
    assert_eq!(fifo.perm, 0o600);
    assert!(matches!(
        image.read(fifo.ino, 0, 10),
        Err(DfsError::NotRegularFile)
    ));
    assert!(matches!(
        image.read(InodeNumber(9999), 0, 1),
        Err(DfsError::NotFound(_))
    ));
    assert!(matches!(
        image.lookup_path("/nope"),
        Err(DfsError::NotFound(_))
    ));
}

#[test]
fn lookup_getattr_and_readlink() {
    let fx = fixture(Algorithm::Zlib);
    let image = mount(&fx.image);
    let data = image
        .lookup(InodeNumber::ROOT, OsStr::new("data"))
        .expect("data");
    assert_eq!(data.kind, FileKind::Directory);
    assert_eq!(data.perm, 0o755);

    let big = image.lookup(data.ino, OsStr::new("big.bin")).expect("big");
    assert_eq!(big.size, 50_000);
    assert_eq!(big.blocks, 50_000_u64.div_ceil(512));
    assert_eq!(image.getattr(big.ino).expect("getattr"), big);

    let link = image.lookup_path_nofollow("/data/link").expect("link");
    assert_eq!(link.kind, FileKind::Symlink);
    assert_eq!(image.readlink(link.ino).expect("target"), b"../a.txt");
    assert!(matches!(image.readlink(big.ino), Err(DfsError::NotSymlink)));
}

#[test]
fn readdir_cookies_resume_iteration() {
    let fx = fixture(Algorithm::Lz4);
    let image = mount(&fx.image);
    let all = image.readdir(InodeNumber::ROOT, 0).expect("readdir");
    let names: Vec<String> = all.iter().map(dfs_core::DirEntry::name_str).collect();
    assert_eq!(names, vec![".", "..", "a.txt", "b.txt", "data"]);
    assert!(all.iter().take(2).all(|e| e.ino == InodeNumber::ROOT));

    let rest = image
        .readdir(InodeNumber::ROOT, all[2].offset)
        .expect("resume");
    let names: Vec<String> = rest.iter().map(dfs_core::DirEntry::name_str).collect();
    assert_eq!(names, vec!["b.txt", "data"]);
    assert!(image
        .readdir(InodeNumber::ROOT, all[4].offset)
        .expect("end")
        .is_empty());

    let data = ino(&image, "/data");
    let entries = image.readdir(data, 0).expect("data");
    assert_eq!(entries[1].ino, InodeNumber::ROOT);
    assert_eq!(entries.len(), 6);
    assert!(matches!(
        image.readdir(ino(&image, "/a.txt"), 0),
        Err(DfsError::NotDirectory)
    ));
}

#[test]
fn statfs_reports_dedup_and_storage() {
    let fx = fixture(Algorithm::Zstd);
    let image = mount(&fx.image);
    let stats = image.statfs().expect("statfs");
    assert_eq!(stats.inodes, 8);
    assert_eq!(stats.file_bytes, 11 + 11 + 50_000);
    assert_eq!(stats.unique_bytes, 11 + 50_000);
    assert_eq!(stats.image_bytes, fx.image.len() as u64);
    assert!(stats.stored_bytes < stats.image_bytes);
    assert_eq!(stats.block_size, 4096);
    assert_eq!(stats.blocks, u64::from(image.header().block_count));
}

#[test]
fn blksize_tracks_largest_block_with_page_floor() {
    let config = BuilderConfig {
        block_size: 65_536,
        ..build_config(Algorithm::Lz4)
    };
    let mut builder = Builder::new(config).expect("builder");
    builder
        .add_file("wide.bin", pseudo_random(100_000, 11).as_slice())
        .expect("wide");
    let image = mount(&builder.finalize().expect("finalize"));
    let wide = image
        .lookup(InodeNumber::ROOT, OsStr::new("wide.bin"))
        .expect("lookup");
    assert_eq!(wide.blksize, 65_536);
    assert_eq!(image.getattr(InodeNumber::ROOT).expect("root").blksize, 65_536);
    assert_eq!(image.statfs().expect("statfs").block_size, 65_536);

    let empty = mount(
        &Builder::new(build_config(Algorithm::Lz4))
            .expect("builder")
            .finalize()
            .expect("finalize"),
    );
    assert_eq!(empty.statfs().expect("statfs").blocks, 0);
    assert_eq!(empty.statfs().expect("statfs").block_size, 4096);
    assert_eq!(empty.getattr(InodeNumber::ROOT).expect("root").blksize, 4096);
}

#[test]
fn walk_lists_every_path() {
    let fx = fixture(Algorithm::Lz4);
    let image = mount(&fx.image);
    let paths: Vec<String> = image
        .walk()
        .expect("walk")
        .iter()
        .map(dfs_meta::WalkEntry::path_str)
        .collect();
    assert_eq!(
        paths,
        vec![
            "/",
            "/a.txt",
            "/b.txt",
            "/data",
            "/data/big.bin",
            "/data/empty",
            "/data/fifo",
            "/data/link",
        ]
    );
}

fn frame_range(image: &Image, block: usize) -> std::ops::Range<usize> {
    let entry = image.metadata().block_index()[block];
    let start = usize::try_from(image.header().blocks_offset + entry.offset).expect("offset");
    start..start + entry.frame_len as usize
}

#[test]
fn corrupt_block_fails_only_its_reads() {
    let fx = fixture(Algorithm::Store);
    let pristine = mount(&fx.image);
    let a = ino(&pristine, "/a.txt");
    let a_block = pristine.metadata().get_chunks(a).expect("chunks")[0].block;
    let range = frame_range(&pristine, a_block.index());

    let mut bytes = fx.image.clone();
    bytes[range.end - 1] ^= 0x55;
    let image = mount(&bytes);

    let err = image.read_range(a, 0, 11).expect_err("corrupt");
    assert!(
        matches!(err, DfsError::CorruptBlock { block, .. } if block == a_block.0),
        "{err:?}"
    );
    // The failure is not cached and does not affect other blocks.
    assert!(image.read_range(a, 0, 11).is_err());
    assert_eq!(image.read_path("/data/big.bin").expect("big"), fx.big);
    assert!(!image.cache().contains(a_block));

    let report = image.check();
    assert_eq!(report.corrupt, 1);
    assert_eq!(report.ok + report.corrupt, u64::from(image.header().block_count));
    assert!(!report.is_clean());
    let bad: Vec<_> = report.verdicts.iter().filter(|v| v.error.is_some()).collect();
    assert_eq!(bad[0].block, a_block);
    assert!(pristine.check().is_clean());
}

#[test]
fn metadata_checksum_is_verified() {
    let fx = fixture(Algorithm::Lz4);
    let header = ImageHeader::parse(&fx.image).expect("header");
    let mut bytes = fx.image.clone();
    let at = usize::try_from(header.metadata_offset + header.metadata_len / 2).expect("offset");
    bytes[at] ^= 0xFF;

    let err = Image::from_bytes(bytes.clone(), &OpenOptions::default()).expect_err("crc");
    assert!(matches!(err, DfsError::CorruptMetadata(_)), "{err:?}");
}

#[test]
fn bad_magic_and_future_versions_are_refused() {
    let fx = fixture(Algorithm::Lz4);

    let mut bytes = fx.image.clone();
    bytes[0] = b'X';
    let err = Image::from_bytes(bytes, &OpenOptions::default()).expect_err("magic");
    assert!(matches!(err, DfsError::Format(_)), "{err:?}");

    let mut header = ImageHeader::parse(&fx.image).expect("header");
    header.version_major += 1;
    let mut bytes = fx.image.clone();
    bytes[..64].copy_from_slice(&header.encode());
    let err = Image::from_bytes(bytes, &OpenOptions::default()).expect_err("version");
    assert!(matches!(err, DfsError::UnsupportedVersion { major: 2, minor: 0 }), "{err:?}");

    let mut header = ImageHeader::parse(&fx.image).expect("header");
    header.version_minor += 3;
    let mut bytes = fx.image.clone();
    bytes[..64].copy_from_slice(&header.encode());
    Image::from_bytes(bytes, &OpenOptions::default()).expect("newer minor is accepted");

    let err = Image::from_bytes(vec![0_u8; 10], &OpenOptions::default()).expect_err("short");
    assert!(matches!(err, DfsError::Format(_)));
}

#[test]
fn truncated_image_is_refused() {
    let fx = fixture(Algorithm::Lz4);
    let cut = fx.image[..fx.image.len() - 1].to_vec();
    let err = Image::from_bytes(cut, &OpenOptions::default()).expect_err("truncated");
    assert!(matches!(err, DfsError::Format(_)), "{err:?}");
}

#[test]
fn concurrent_readers_share_decompressed_blocks() {
    let fx = fixture(Algorithm::Zstd);
    let options = OpenOptions {
        cache: CacheConfig {
            budget_bytes: 1 << 20,
            workers: 2,
            io_timeout_ms: None,
        },
        ..OpenOptions::default()
    };
    let image = Arc::new(Image::from_bytes(fx.image.clone(), &options).expect("mount"));
    let big = ino(&image, "/data/big.bin");
    let threads = 8;
    let barrier = Barrier::new(threads);

    std::thread::scope(|s| {
        for t in 0..threads {
            let image = Arc::clone(&image);
            let barrier = &barrier;
            let expected = &fx.big;
            s.spawn(move || {
                let reader = image.reader();
                barrier.wait();
                for round in 0..20_usize {
                    let offset = (t * 997 + round * 2311) % 45_000;
                    let got = reader
                        .read(big, i64::try_from(offset).expect("offset"), 5000)
                        .expect("read");
                    assert_eq!(got, &expected[offset..offset + 5000]);
                }
            });
        }
    });

    let stats = image.cache_stats();
    let blocks = u64::from(image.header().block_count);
    assert!(stats.decompressions <= blocks, "{stats:?}");
    assert_eq!(stats.evictions, 0);
}

#[test]
fn image_files_mount_from_disk() {
    let fx = fixture(Algorithm::Brotli);
    let dir = tempfile::tempdir().expect("dir");
    let path = dir.path().join("fixture.dfs");
    std::fs::write(&path, &fx.image).expect("write");
    let image = Image::open(&path, &OpenOptions::default()).expect("open");
    assert_eq!(image.read_path("/data/big.bin").expect("big"), fx.big);
    assert!(matches!(
        Image::open(dir.path().join("missing.dfs"), &OpenOptions::default()),
        Err(DfsError::Io(_))
    ));
}
