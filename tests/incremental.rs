//! Determinism, resume and store-invalidation tests through the session

use chunksync::config::Config;
use chunksync::engine::Strategy;
use chunksync::session::{FileSession, LoadState};
use chunksync::stat::FileStat;
use chunksync::store::{FileIdentity, HashStore, StoreRecord};
use std::io::Write;
use std::path::{Path, PathBuf};

fn config_in(dir: &Path, chunk_size: u64) -> Config {
    Config {
        chunk_size,
        cache_root: dir.join("cache"),
        jobs: 2,
        ..Config::default()
    }
}

fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(data).unwrap();
    path
}

fn dump_chunks(store: &HashStore) -> serde_json::Value {
    store.dump().unwrap()["chunks"].clone()
}

#[test]
fn hashing_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 512);
    let data: Vec<u8> = (0..5000).map(|i| (i % 17) as u8).collect();

    let file_a = write_file(dir.path(), "a.bin", &data);
    let file_b = write_file(dir.path(), "b.bin", &data);

    let session_a = FileSession::open(&config, &file_a, None).unwrap();
    session_a.hash(true, Strategy::Direct).unwrap();
    session_a.on_exit_flush().unwrap();

    let session_b = FileSession::open(&config, &file_b, None).unwrap();
    session_b.hash(true, Strategy::ReadHash).unwrap();
    session_b.on_exit_flush().unwrap();

    // Same bytes, same chunk size: identical chunk hashes either way
    let chunks_a = dump_chunks(&HashStore::at(session_a.store_path().to_path_buf()));
    let chunks_b = dump_chunks(&HashStore::at(session_b.store_path().to_path_buf()));
    assert_eq!(chunks_a, chunks_b);
}

#[test]
fn interrupted_run_resumes_to_the_same_index() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 512);
    let data: Vec<u8> = (0..8000).map(|i| (i % 23) as u8).collect();
    let input = write_file(dir.path(), "input.bin", &data);

    // The uninterrupted baseline
    let full = FileSession::open(&config, &input, None).unwrap();
    full.hash(true, Strategy::Direct).unwrap();
    full.on_exit_flush().unwrap();
    let baseline = dump_chunks(&HashStore::at(full.store_path().to_path_buf()));

    // Simulate a run killed after 5 chunks: persist a store holding only
    // the prefix of the baseline index
    let store_path = dir.path().join("partial.store");
    {
        let stat = FileStat::capture(&input).unwrap();
        let identity = FileIdentity::new(std::fs::canonicalize(&input).unwrap(), &stat);
        let mut record = StoreRecord::new(&identity, 512);

        let session = FileSession::open(&config, &input, None).unwrap();
        session.hash(true, Strategy::Direct).unwrap();
        // Hash everything, then keep only chunks 0..5 in the partial store
        let full_store = HashStore::at(session.store_path().to_path_buf());
        let chunks = dump_chunks(&full_store);
        for ordinal in 0..5u64 {
            let hex = chunks[ordinal.to_string().as_str()].as_str().unwrap();
            record.chunks.insert(
                ordinal,
                chunksync::digest::ChunkHash::from_hex(hex).unwrap(),
            );
        }
        HashStore::at(store_path.clone()).save(&record).unwrap();
    }

    // Resume incrementally from the partial store
    let resumed = FileSession::open(&config, &input, Some(store_path.clone())).unwrap();
    assert_eq!(*resumed.load_state(), LoadState::Loaded);
    assert_eq!(resumed.indexed_chunks(), 5);
    let stats = resumed.hash(true, Strategy::Direct).unwrap();
    resumed.on_exit_flush().unwrap();

    // 16 chunks total; 11 were missing plus the re-verified watermark chunk
    assert_eq!(stats.chunks_hashed, 12);
    assert_eq!(dump_chunks(&HashStore::at(store_path)), baseline);
}

#[test]
fn chunk_size_change_invalidates_store() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "input.bin", &vec![1u8; 4096]);
    let store_path = dir.path().join("explicit.store");

    let config = config_in(dir.path(), 512);
    let session = FileSession::open(&config, &input, Some(store_path.clone())).unwrap();
    session.hash(true, Strategy::Direct).unwrap();
    session.on_exit_flush().unwrap();

    // Same file, different chunk size: the record must not be trusted
    let config = config_in(dir.path(), 1024);
    let session = FileSession::open(&config, &input, Some(store_path)).unwrap();
    assert!(matches!(session.load_state(), LoadState::Discarded(_)));
    assert_eq!(session.indexed_chunks(), 0);
}

#[test]
fn touched_mtime_invalidates_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 512);
    let input = write_file(dir.path(), "input.bin", &vec![1u8; 1024]);

    let session = FileSession::open(&config, &input, None).unwrap();
    session.hash(true, Strategy::Direct).unwrap();
    session.on_exit_flush().unwrap();

    // Same content, new mtime
    filetime::set_file_mtime(&input, filetime::FileTime::from_unix_time(1_600_000_000, 0))
        .unwrap();

    let session = FileSession::open(&config, &input, None).unwrap();
    assert!(matches!(session.load_state(), LoadState::Discarded(_)));
}

#[test]
fn foreign_store_rebuilds_from_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 512);
    let input = write_file(dir.path(), "input.bin", &vec![1u8; 1024]);
    let store_path = dir.path().join("garbage.store");
    std::fs::write(&store_path, b"definitely not a chunk store").unwrap();

    // Corrupt data is treated as absent: full rebuild, no hard failure
    let session = FileSession::open(&config, &input, Some(store_path)).unwrap();
    assert!(matches!(session.load_state(), LoadState::Discarded(_)));
    let stats = session.hash(true, Strategy::Direct).unwrap();
    assert_eq!(stats.chunks_hashed, 2);
}
