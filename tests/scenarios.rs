//! End-to-end scenarios against the public `ArchiveTranslator` surface and
//! the lower-level stream/presence primitives.

use std::io::{Read, Seek, SeekFrom, Write};

use rafs::presence::{FileDataPresence, PresenceOptions, RamBudget};
use rafs::stream::buffered::BufferedStream;
use rafs::stream::OpenMode;
use rafs::translator::img::ImgTranslator;
use rafs::translator::zip::ZipTranslator;
use rafs::ArchiveTranslator;

/// A hand-built v2 archive (header + one record + one content block) is
/// byte-identical after `load; save`.
#[test]
fn img_v2_round_trip_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("fixture.img");

    let mut input = Vec::new();
    input.extend_from_slice(b"VER2");
    input.extend_from_slice(&1u32.to_le_bytes()); // entry_count
    input.extend_from_slice(&1u32.to_le_bytes()); // block_offset
    input.extend_from_slice(&1u16.to_le_bytes()); // size_blocks
    input.extend_from_slice(&0u16.to_le_bytes()); // expanded_size_blocks
    let mut name = [0u8; 24];
    name[..5].copy_from_slice(b"A.DFF");
    input.extend_from_slice(&name);
    assert_eq!(input.len(), 40);
    input.resize(2048, 0); // zero-padding to block 1
    input.extend(std::iter::repeat(0xAAu8).take(2048));
    assert_eq!(input.len(), 4096);

    std::fs::write(&archive_path, &input).unwrap();

    let budget = RamBudget::new(16 * 1024 * 1024);
    let t = ImgTranslator::open_v2(&archive_path, budget).unwrap();
    assert!(t.exists("A.DFF"));
    t.save().unwrap();

    let output = std::fs::read(&archive_path).unwrap();
    assert_eq!(output, input);
}

/// Creating an empty ZIP, writing one stored entry, saving, and reopening
/// yields the exact bytes and CRC32 of the original content.
#[test]
fn zip_store_create_then_read_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("fixture.zip");
    let budget = RamBudget::new(16 * 1024 * 1024);

    let mut t = ZipTranslator::create(&archive_path, budget.clone());
    t.set_compression_level(0);
    {
        let mut f = t.open("hello.txt", OpenMode::WRITE | OpenMode::CREATE).unwrap();
        f.write_all(b"hello").unwrap();
    }
    t.save().unwrap();

    assert_eq!(crc32fast::hash(b"hello"), 0x3610A686);

    let t2 = ZipTranslator::open(&archive_path, budget).unwrap();
    assert!(t2.exists("hello.txt"));
    assert_eq!(t2.size("hello.txt").unwrap(), 5);
    let mut f = t2.open("hello.txt", OpenMode::READ).unwrap();
    let mut out = Vec::new();
    f.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"hello");
}

/// A shared RAM budget correctly forces spillover to disk once a single
/// sink's growth crosses `file_max_in_ram`, and the budget returns to zero
/// once every disk-backed sink no longer reserves RAM.
#[test]
fn presence_spills_to_disk_under_ram_pressure() {
    let budget = RamBudget::new(1000);
    let opts = PresenceOptions {
        file_max_in_ram: 600,
        perc_file_memory_fade_in: 0.75,
    };

    let mut first = FileDataPresence::new(budget.clone(), opts);
    first.write_all(&vec![1u8; 500]).unwrap();
    assert!(!first.is_disk_backed());

    let mut second = FileDataPresence::new(budget.clone(), opts);
    second.write_all(&vec![2u8; 700]).unwrap();
    assert!(second.is_disk_backed());

    first.write_all(&vec![1u8; 300]).unwrap();
    assert!(first.is_disk_backed());

    assert_eq!(budget.used(), 0);

    first.seek(SeekFrom::Start(0)).unwrap();
    let mut first_out = Vec::new();
    first.read_to_end(&mut first_out).unwrap();
    assert_eq!(first_out.len(), 800);

    second.seek(SeekFrom::Start(0)).unwrap();
    let mut second_out = Vec::new();
    second.read_to_end(&mut second_out).unwrap();
    assert_eq!(second_out, vec![2u8; 700]);
}

/// Renaming a file across directories moves its bytes and makes the old
/// path disappear, without requiring a save/reload round trip.
#[test]
fn rename_moves_file_across_directories() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("fixture.zip");
    let budget = RamBudget::new(16 * 1024 * 1024);

    let t = ZipTranslator::create(&archive_path, budget);
    t.create_dir("a").unwrap();
    t.create_dir("b").unwrap();
    {
        let mut f = t.open("/a/x.dat", OpenMode::WRITE | OpenMode::CREATE).unwrap();
        f.write_all(&[0x01, 0x02, 0x03]).unwrap();
    }

    t.rename("/a/x.dat", "/b/y.dat").unwrap();

    assert!(!t.exists("/a/x.dat"));
    let mut f = t.open("/b/y.dat", OpenMode::READ).unwrap();
    let mut out = Vec::new();
    f.read_to_end(&mut out).unwrap();
    assert_eq!(out, vec![0x01, 0x02, 0x03]);
}

/// Seeking around inside a deflated entry returns the correct window
/// regardless of seek direction, including a backward seek after having
/// already read forward — exercised through the chunked sector-cache read
/// path, which resets its decoder on exactly this kind of backward seek.
#[test]
fn zip_deflate_supports_random_seeks() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("fixture.zip");
    let budget = RamBudget::new(16 * 1024 * 1024);

    let content: Vec<u8> = (0..1024 * 1024).map(|i| (i % 256) as u8).collect();

    let mut t = ZipTranslator::create(&archive_path, budget.clone());
    t.set_compression_level(6);
    {
        let mut f = t.open("big.bin", OpenMode::WRITE | OpenMode::CREATE).unwrap();
        f.write_all(&content).unwrap();
    }
    t.save().unwrap();

    let t2 = ZipTranslator::open(&archive_path, budget).unwrap();
    let mut f = t2.open("big.bin", OpenMode::READ).unwrap();

    f.seek(SeekFrom::Start(512 * 1024)).unwrap();
    let mut mid = [0u8; 16];
    f.read_exact(&mut mid).unwrap();
    assert_eq!(mid, content[512 * 1024..512 * 1024 + 16]);

    f.seek(SeekFrom::Start(0)).unwrap();
    let mut start = [0u8; 16];
    f.read_exact(&mut start).unwrap();
    assert_eq!(start, content[0..16]);
}

/// A partial overwrite inside a `BufferedStream`'s window is visible to a
/// subsequent read even before any flush, and preserves the bytes on
/// either side of the overwritten range.
#[test]
fn buffered_stream_partial_overwrite_is_visible_before_flush() {
    let cursor = std::io::Cursor::new(b"0123456789".to_vec());
    let mut stream = BufferedStream::with_capacity(cursor, 4).unwrap();

    stream.seek(SeekFrom::Start(2)).unwrap();
    stream.write_all(b"ab").unwrap();

    stream.seek(SeekFrom::Start(0)).unwrap();
    let mut out = [0u8; 10];
    stream.read_exact(&mut out).unwrap();
    assert_eq!(&out, b"01ab456789");
}

/// The CRC32 recorded for a ZIP entry always matches the CRC32 of the last
/// bytes written into it, for both compression methods.
#[test]
fn zip_crc32_matches_written_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("fixture.zip");
    let budget = RamBudget::new(16 * 1024 * 1024);

    let mut t = ZipTranslator::create(&archive_path, budget);
    t.set_compression_level(6);
    {
        let mut f = t.open("note.txt", OpenMode::WRITE | OpenMode::CREATE).unwrap();
        f.write_all(b"deflate me please").unwrap();
    }
    t.save().unwrap();

    let bytes = std::fs::read(&archive_path).unwrap();
    // the local file header's crc32 field sits right after the 10-byte
    // version/flags/compression/mod_time/mod_date prefix that follows the
    // 4-byte signature.
    let crc_field = u32::from_le_bytes(bytes[14..18].try_into().unwrap());
    assert_eq!(crc_field, crc32fast::hash(b"deflate me please"));
}

/// Reserving more RAM than the quota allows fails, rather than silently
/// exceeding it.
#[test]
fn ram_budget_refuses_overcommit() {
    let budget = RamBudget::new(100);
    let opts = PresenceOptions {
        file_max_in_ram: 10_000,
        perc_file_memory_fade_in: 0.9,
    };
    let mut p = FileDataPresence::new(budget.clone(), opts);
    p.write_all(&vec![0u8; 50]).unwrap();
    assert!(!p.is_disk_backed());
    assert_eq!(budget.used(), 50);

    // a second sink trying to reserve more than the remaining 50 bytes of
    // quota must spill to disk instead of blowing through the budget.
    let mut q = FileDataPresence::new(budget.clone(), opts);
    q.write_all(&vec![0u8; 80]).unwrap();
    assert!(q.is_disk_backed());
    assert_eq!(budget.used(), 50);
}
