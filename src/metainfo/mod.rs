mod builder;
mod digest;

use std::ffi::OsStr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use digest::Digest;

pub type BlockId = usize;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid block id {id} (total blocks: {total})")]
    OutOfRange { id: BlockId, total: usize },

    #[error("inconsistent metadata: {0}")]
    Inconsistent(String),
}

/// one contiguous, individually verifiable byte range of the shared file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    pub id: BlockId,
    pub offset: u64,
    pub size: u64,
    pub hash: Digest,
}

impl BlockDescriptor {
    pub fn len(&self) -> usize {
        self.size as usize
    }
}

/// Describes how a file is split into blocks, with the digests needed to verify every block and
/// the assembled whole. Produced once from the complete file and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub file_size: u64,
    pub block_size: u64,
    pub total_blocks: usize,
    pub file_hash: Digest,
    pub blocks: Vec<BlockDescriptor>,
}

impl FileMetadata {
    /// loads a metadata file and checks that its block layout actually tiles the file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let raw = tokio::fs::read(path).await?;
        let metadata: Self = serde_json::from_slice(&raw)?;
        metadata.check_layout()?;
        Ok(metadata)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), MetadataError> {
        let raw = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }

    pub fn block(&self, id: BlockId) -> Result<&BlockDescriptor, MetadataError> {
        self.blocks.get(id).ok_or(MetadataError::OutOfRange {
            id,
            total: self.total_blocks,
        })
    }

    fn check_layout(&self) -> Result<(), MetadataError> {
        use MetadataError::Inconsistent;

        // a leecher writes to download_dir/file_name
        if Path::new(&self.file_name).file_name() != Some(OsStr::new(&self.file_name)) {
            return Err(Inconsistent(format!(
                "file_name {:?} is not a bare file name",
                self.file_name
            )));
        }

        if self.blocks.len() != self.total_blocks {
            return Err(Inconsistent(format!(
                "{} blocks listed but total_blocks is {}",
                self.blocks.len(),
                self.total_blocks
            )));
        }

        let mut next_offset = 0;
        for (expected_id, block) in self.blocks.iter().enumerate() {
            if block.id != expected_id {
                return Err(Inconsistent(format!(
                    "block at position {expected_id} has id {}",
                    block.id
                )));
            }
            if block.offset != next_offset {
                return Err(Inconsistent(format!(
                    "block {} starts at {} but the previous block ends at {next_offset}",
                    block.id, block.offset
                )));
            }
            if block.size == 0 {
                return Err(Inconsistent(format!("block {} is empty", block.id)));
            }
            next_offset += block.size;
        }

        if next_offset != self.file_size {
            return Err(Inconsistent(format!(
                "blocks cover {next_offset} bytes but file_size is {}",
                self.file_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn three_block_metadata() -> FileMetadata {
        let sizes = [4096u64, 4096, 1024];
        let mut offset = 0;
        let blocks = sizes
            .iter()
            .enumerate()
            .map(|(id, &size)| {
                let block = BlockDescriptor {
                    id,
                    offset,
                    size,
                    hash: Digest::of(vec![id as u8; size as usize]),
                };
                offset += size;
                block
            })
            .collect();

        FileMetadata {
            file_name: "sample.bin".into(),
            file_size: 9216,
            block_size: 4096,
            total_blocks: 3,
            file_hash: Digest::from("sha256:unused"),
            blocks,
        }
    }

    #[tokio::test]
    async fn save_then_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sample.meta.json");
        let metadata = three_block_metadata();

        metadata.save(&path).await.unwrap();
        let loaded = FileMetadata::load(&path).await.unwrap();

        assert_eq!(loaded, metadata);
    }

    #[tokio::test]
    async fn loads_field_names_used_by_the_generator() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("meta.json");
        let raw = r#"{
            "file_name": "a.txt",
            "file_size": 5,
            "block_size": 4,
            "total_blocks": 2,
            "file_hash": "sha256:aa",
            "blocks": [
                {"id": 0, "offset": 0, "size": 4, "hash": "sha256:bb"},
                {"id": 1, "offset": 4, "size": 1, "hash": "sha256:cc"}
            ]
        }"#;
        tokio::fs::write(&path, raw).await.unwrap();

        let metadata = FileMetadata::load(&path).await.unwrap();
        assert_eq!(metadata.block(1).unwrap().hash, Digest::from("sha256:cc"));
    }

    #[tokio::test]
    async fn missing_file_fails_to_load() {
        let temp = TempDir::new().unwrap();
        let err = FileMetadata::load(temp.path().join("nope.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Io(_)));
    }

    #[tokio::test]
    async fn garbage_fails_to_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("meta.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let err = FileMetadata::load(&path).await.unwrap_err();
        assert!(matches!(err, MetadataError::Json(_)));
    }

    #[rstest]
    #[case(0)]
    #[case(2)]
    fn block_lookup_in_range(#[case] id: BlockId) {
        let metadata = three_block_metadata();
        assert_eq!(metadata.block(id).unwrap().id, id);
    }

    #[rstest]
    #[case(3)]
    #[case(usize::MAX)]
    fn block_lookup_out_of_range(#[case] id: BlockId) {
        let metadata = three_block_metadata();
        assert!(matches!(
            metadata.block(id),
            Err(MetadataError::OutOfRange { total: 3, .. })
        ));
    }

    #[rstest]
    #[case::count_mismatch(|m: &mut FileMetadata| m.total_blocks = 4)]
    #[case::gap(|m: &mut FileMetadata| m.blocks[1].offset = 4097)]
    #[case::empty_block(|m: &mut FileMetadata| { m.blocks[2].size = 0; m.file_size = 8192 })]
    #[case::wrong_id(|m: &mut FileMetadata| m.blocks[1].id = 7)]
    #[case::short_cover(|m: &mut FileMetadata| m.file_size = 10_000)]
    #[case::parent_dir(|m: &mut FileMetadata| m.file_name = "../sample.bin".into())]
    #[case::nested(|m: &mut FileMetadata| m.file_name = "nested/sample.bin".into())]
    #[case::no_name(|m: &mut FileMetadata| m.file_name = String::new())]
    fn inconsistent_layouts_are_rejected(#[case] corrupt: fn(&mut FileMetadata)) {
        let mut metadata = three_block_metadata();
        corrupt(&mut metadata);
        assert!(matches!(
            metadata.check_layout(),
            Err(MetadataError::Inconsistent(_))
        ));
    }

    #[test]
    fn consistent_layout_passes() {
        three_block_metadata().check_layout().unwrap();
    }
}
