use crate::*;

use shard_core::wire::MAGIC;
use shard_core::{Chunk, ChunkAvailability, MAX_CHUNK_SIZE};
use shard_services::{DistributedFile, FileLibrary, InsertOutcome};

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn chunk(name: &str, data: &[u8], id: u32) -> Chunk {
    let start = id as usize * MAX_CHUNK_SIZE;
    let end = (start + MAX_CHUNK_SIZE).min(data.len());
    Chunk::new(name, id, data[start..end].to_vec()).unwrap()
}

/// 150000 bytes splits into 65536 / 65536 / 18928. With the middle chunk
/// missing the file reopens with exactly `{1}` outstanding.
#[test]
fn partial_file_with_middle_chunk_missing() {
    let dir = temp_dir("store");
    let path = dir.join("movie.bin");
    let data = content(150_000);

    let meta = ChunkAvailability::missing("movie.bin", data.len() as u64);
    assert_eq!(
        (0..3).map(|i| meta.chunk_len(i)).collect::<Vec<_>>(),
        vec![65_536, 65_536, 18_928]
    );

    let mut file = DistributedFile::new_at(&path, &meta).unwrap();
    assert_eq!(file.insert(chunk("movie.bin", &data, 0)).unwrap(), InsertOutcome::Snapshot);
    assert_eq!(file.insert(chunk("movie.bin", &data, 2)).unwrap(), InsertOutcome::Snapshot);
    drop(file);

    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(&on_disk[..MAGIC.len()], &MAGIC[..]);
    let (saved, header_len) = ChunkAvailability::decode(&on_disk[MAGIC.len()..]).unwrap();
    assert_eq!(saved.bitmap, vec![true, false, true]);
    assert_eq!(on_disk.len(), MAGIC.len() + header_len + 150_000);

    let mut reopened = DistributedFile::open(&path).unwrap();
    assert_eq!(reopened.incomplete_ids().iter().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(reopened.chunk(0).unwrap().len(), 65_536);
    assert_eq!(reopened.chunk(2).unwrap().len(), 18_928);
    assert!(reopened.chunk(1).is_none());

    assert_eq!(
        reopened.insert(chunk("movie.bin", &data, 1)).unwrap(),
        InsertOutcome::Completed
    );
    assert_eq!(std::fs::read(&path).unwrap(), data);

    let _ = std::fs::remove_dir_all(dir);
}

/// A complete file on disk imports with every chunk present.
#[test]
fn complete_file_imports_as_chunks() {
    let dir = temp_dir("store");
    let path = dir.join("plain.bin");
    let data = content(3 * MAX_CHUNK_SIZE + 1);
    std::fs::write(&path, &data).unwrap();

    let file = DistributedFile::open(&path).unwrap();
    assert!(file.is_complete());
    assert_eq!(file.chunk_count(), 4);
    assert_eq!(file.chunk(3).unwrap().len(), 1);
    let joined: Vec<u8> = file
        .chunks()
        .iter()
        .flat_map(|c| c.as_ref().unwrap().data().to_vec())
        .collect();
    assert_eq!(joined, data);

    let _ = std::fs::remove_dir_all(dir);
}

/// A library restarted over the same root resumes where it stopped.
#[tokio::test]
async fn library_resumes_after_restart() {
    let dir = temp_dir("store");
    let data = content(6 * MAX_CHUNK_SIZE);
    let name = "resume.bin";

    {
        let lib = FileLibrary::new(&dir).unwrap();
        lib.track(ChunkAvailability::missing(name, data.len() as u64))
            .await
            .unwrap();
        for id in [5, 0, 3] {
            lib.insert(chunk(name, &data, id)).await.unwrap();
        }
    }

    let lib = FileLibrary::new(&dir).unwrap();
    assert_eq!(lib.import_root().await.unwrap(), 1);
    {
        let file = lib.get(name).unwrap();
        let file = file.lock().await;
        // the third insert did not reach a snapshot, so only two survive
        assert_eq!(file.complete_count(), 2);
    }

    let mut outcomes = Vec::new();
    for id in 0..6 {
        outcomes.push(lib.insert(chunk(name, &data, id)).await.unwrap());
    }
    assert_eq!(outcomes[0], InsertOutcome::Duplicate);
    assert_eq!(outcomes[4], InsertOutcome::Completed);
    assert_eq!(outcomes[5], InsertOutcome::Duplicate);
    assert_eq!(std::fs::read(dir.join(name)).unwrap(), data);

    let _ = std::fs::remove_dir_all(dir);
}
