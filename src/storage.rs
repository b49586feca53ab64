//! Positional file access and whole-file hashing.
//!
//! Every call opens its own handle, so tasks touching disjoint byte ranges of the same file never
//! share a cursor and need no coordination with each other.

use std::io::{self, SeekFrom};
use std::path::Path;

use sha2::{Digest as _, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::metainfo::Digest;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

pub async fn hash_file(path: impl AsRef<Path>) -> io::Result<Digest> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0; HASH_CHUNK_SIZE];

    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }

    Ok(Digest::from_hasher(hasher))
}

/// reads exactly `length` bytes starting at `offset`. a file that ends early is an error.
pub async fn read_exact_range(
    path: impl AsRef<Path>,
    offset: u64,
    length: usize,
) -> io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buf = vec![0; length];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_at_offset(path: impl AsRef<Path>, offset: u64, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    // tokio files complete writes in the background, flush before the handle goes away
    file.flush().await?;
    Ok(())
}

pub async fn file_size(path: impl AsRef<Path>) -> io::Result<u64> {
    Ok(fs::metadata(path).await?.len())
}

/// creates (or truncates) `path` and extends it to `size` zero bytes.
pub async fn preallocate(path: impl AsRef<Path>, size: u64) -> io::Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await?;
    file.set_len(size).await?;
    file.sync_all().await?;
    Ok(())
}
