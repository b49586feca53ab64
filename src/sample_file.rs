//! Synthetic files with a recognisable per-block layout, handy for exercising a swarm by hand.
//!
//! Every block opens with an 18 byte ascii header naming its id, followed by a 64 byte pattern
//! unique to that block repeated up to the block's end. A misplaced block is obvious in a hex
//! dump of the reassembled file.

use std::io;
use std::path::Path;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::metainfo::BlockId;

const PATTERN_LEN: usize = 64;

#[derive(Debug, Error)]
#[error("invalid size {0:?}, expected a number with an optional B/KB/MB/GB suffix")]
pub struct InvalidSize(String);

/// parses sizes such as `512`, `512B`, `10kb`, `1MB` or `2GB` using 1024 based multipliers.
pub fn parse_size(raw: &str) -> Result<u64, InvalidSize> {
    let normalized = raw.trim().to_ascii_uppercase();

    let (digits, multiplier) = [("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10), ("B", 1)]
        .into_iter()
        .find_map(|(suffix, multiplier)| {
            normalized
                .strip_suffix(suffix)
                .map(|digits| (digits, multiplier))
        })
        .unwrap_or((normalized.as_str(), 1u64));

    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|value| value.checked_mul(multiplier))
        .ok_or_else(|| InvalidSize(raw.to_owned()))
}

pub async fn write_sample_file(path: impl AsRef<Path>, size: u64, block_size: u64) -> io::Result<()> {
    if block_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "block size must be positive",
        ));
    }

    let mut out = BufWriter::new(File::create(path).await?);
    let mut block = vec![0; block_size as usize];
    let mut written = 0;
    let mut block_id = 0;

    while written < size {
        let len = block_size.min(size - written) as usize;
        fill_block(&mut block[..len], block_id);
        out.write_all(&block[..len]).await?;

        written += len as u64;
        block_id += 1;
    }

    out.flush().await?;
    Ok(())
}

fn fill_block(block: &mut [u8], block_id: BlockId) {
    let header = format!("BLOCK:{block_id:06}     \n");
    let header = header.as_bytes();

    if block.len() <= header.len() {
        let len = block.len();
        block.copy_from_slice(&header[..len]);
        return;
    }

    block[..header.len()].copy_from_slice(header);

    let pattern: Vec<u8> = (0..PATTERN_LEN)
        .map(|i| ((block_id * PATTERN_LEN + i) % 256) as u8)
        .collect();

    for (dst, src) in block[header.len()..]
        .iter_mut()
        .zip(pattern.iter().cycle())
    {
        *dst = *src;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("100", 100)]
    #[case("512B", 512)]
    #[case("10KB", 10 * 1024)]
    #[case(" 1mb ", 1024 * 1024)]
    #[case("2GB", 2 * 1024 * 1024 * 1024)]
    fn parses_sizes(#[case] raw: &str, #[case] expected: u64) {
        assert_eq!(parse_size(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("MB")]
    #[case("ten KB")]
    #[case("-5KB")]
    fn rejects_bad_sizes(#[case] raw: &str) {
        assert!(parse_size(raw).is_err());
    }

    #[test]
    fn block_starts_with_header_then_pattern() {
        let mut block = vec![0; 100];
        fill_block(&mut block, 3);

        assert_eq!(&block[..18], b"BLOCK:000003     \n");
        // pattern byte i of block 3 is (3 * 64 + i) % 256
        assert_eq!(block[18], 192);
        assert_eq!(block[18 + 63], 255);
        assert_eq!(block[18 + 64], 192);
    }

    #[test]
    fn tiny_block_holds_truncated_header() {
        let mut block = vec![0; 5];
        fill_block(&mut block, 12);
        assert_eq!(&block, b"BLOCK");
    }

    #[tokio::test]
    async fn writes_requested_size() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sample.bin");

        write_sample_file(&path, 2500, 1024).await.unwrap();

        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents.len(), 2500);
        assert!(contents.starts_with(b"BLOCK:000000"));
        assert_eq!(&contents[1024..1036], b"BLOCK:000001");
        assert_eq!(&contents[2048..2060], b"BLOCK:000002");
    }
}
