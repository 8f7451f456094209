//! Content blocks: chunking, sealing and opening file data.

use crate::codec::sha256;
use crate::crypto::SecretKey;
use crate::error::{BlockError, CoreError, CoreResult};
use crate::manifest::{BlockRef, FileManifest};
use crate::types::BlockId;

/// Default block size (64 KiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 1 << 16;

const BLOCK_AAD: &[u8] = b"sealdrive-block";

/// An encrypted block ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    /// Content address (SHA-256 of `data`).
    pub id: BlockId,
    /// Ciphertext.
    pub data: Vec<u8>,
}

/// Splits file content into sealed blocks.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    block_size: u64,
}

impl Chunker {
    /// Creates a chunker.
    ///
    /// # Errors
    ///
    /// Fails if `block_size` is zero.
    pub fn new(block_size: u64) -> CoreResult<Self> {
        if block_size == 0 {
            return Err(CoreError::invalid_operation("block size must be positive"));
        }
        Ok(Self { block_size })
    }

    /// Returns the block size.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Splits `data` into blocks, sealing each with the workspace key.
    ///
    /// # Errors
    ///
    /// Fails if encryption fails.
    pub fn split(
        &self,
        data: &[u8],
        workspace_key: &SecretKey,
    ) -> CoreResult<(FileManifest, Vec<SealedBlock>)> {
        let chunk_len = usize::try_from(self.block_size).unwrap_or(usize::MAX);
        let mut refs = Vec::new();
        let mut sealed_blocks = Vec::new();
        let mut offset = 0u64;

        for chunk in data.chunks(chunk_len) {
            let sealed = workspace_key.seal(chunk, BLOCK_AAD)?;
            let id = BlockId::of(&sealed);
            refs.push(BlockRef {
                id,
                offset,
                size: chunk.len() as u64,
                digest: sha256(chunk),
            });
            sealed_blocks.push(SealedBlock { id, data: sealed });
            offset += chunk.len() as u64;
        }

        Ok((
            FileManifest {
                blocks: refs,
                size: offset,
                block_size: self.block_size,
            },
            sealed_blocks,
        ))
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Checks and decrypts one block.
///
/// # Errors
///
/// Returns [`BlockError::AddressMismatch`] if the ciphertext is not the
/// referenced block, and [`BlockError::Corrupted`] if it does not decrypt
/// to the referenced plaintext.
pub fn open_block(
    block: &BlockRef,
    sealed: &[u8],
    workspace_key: &SecretKey,
) -> Result<Vec<u8>, BlockError> {
    if BlockId::of(sealed) != block.id {
        return Err(BlockError::AddressMismatch { id: block.id });
    }
    let plaintext = workspace_key
        .open(sealed, BLOCK_AAD)
        .map_err(|e| BlockError::Corrupted {
            id: block.id,
            reason: e.to_string(),
        })?;
    if plaintext.len() as u64 != block.size || sha256(&plaintext) != block.digest {
        return Err(BlockError::Corrupted {
            id: block.id,
            reason: "plaintext digest mismatch".to_string(),
        });
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_tiles_the_content() {
        let key = SecretKey::generate();
        let data: Vec<u8> = (0..10u8).collect();
        let (file, blocks) = Chunker::new(4).unwrap().split(&data, &key).unwrap();

        assert_eq!(file.size, 10);
        assert_eq!(file.blocks.len(), 3);
        assert_eq!(
            file.blocks.iter().map(|b| b.size).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        assert!(file.validate().is_ok());

        let mut rebuilt = Vec::new();
        for (r, sealed) in file.blocks.iter().zip(&blocks) {
            assert_eq!(r.id, sealed.id);
            rebuilt.extend(open_block(r, &sealed.data, &key).unwrap());
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn empty_content_has_no_blocks() {
        let (file, blocks) = Chunker::default()
            .split(&[], &SecretKey::generate())
            .unwrap();
        assert_eq!(file, FileManifest::empty(DEFAULT_BLOCK_SIZE));
        assert!(blocks.is_empty());
    }

    #[test]
    fn zero_block_size_rejected() {
        assert!(Chunker::new(0).is_err());
    }

    #[test]
    fn open_detects_substitution_and_wrong_key() {
        let key = SecretKey::generate();
        let (file, blocks) = Chunker::new(4).unwrap().split(b"abcdefgh", &key).unwrap();

        assert!(matches!(
            open_block(&file.blocks[0], &blocks[1].data, &key),
            Err(BlockError::AddressMismatch { .. })
        ));
        assert!(matches!(
            open_block(&file.blocks[0], &blocks[0].data, &SecretKey::generate()),
            Err(BlockError::Corrupted { .. })
        ));

        let mut lying = file.blocks[0].clone();
        lying.digest = [0; 32];
        assert!(matches!(
            open_block(&lying, &blocks[0].data, &key),
            Err(BlockError::Corrupted { .. })
        ));
    }
}
