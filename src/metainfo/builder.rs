use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::{BlockDescriptor, Digest, FileMetadata, MetadataError};
use crate::storage;

impl FileMetadata {
    /// chunks the file at `path` into `block_size` blocks (the last one may be shorter) and
    /// records the digest of every block and of the whole file.
    pub async fn generate(path: impl AsRef<Path>, block_size: u64) -> Result<Self, MetadataError> {
        if block_size == 0 {
            return Err(MetadataError::Inconsistent(
                "block size must be positive".into(),
            ));
        }

        let path = path.as_ref();
        let file_size = storage::file_size(path).await?;
        let file_hash = storage::hash_file(path).await?;
        let total_blocks = file_size.div_ceil(block_size) as usize;

        let mut file = File::open(path).await?;
        let mut buf = vec![0; block_size as usize];
        let mut blocks = Vec::with_capacity(total_blocks);

        for id in 0..total_blocks {
            let offset = id as u64 * block_size;
            let size = block_size.min(file_size - offset);
            let chunk = &mut buf[..size as usize];
            file.read_exact(chunk).await?;

            blocks.push(BlockDescriptor {
                id,
                offset,
                size,
                hash: Digest::of(&*chunk),
            });
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            file_name,
            file_size,
            block_size,
            total_blocks,
            file_hash,
            blocks,
        })
    }
}
