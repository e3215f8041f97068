// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Packing shards into transportable blocks
//!
//! A [`Block`] is a salted container of individually compressed shards plus the journal entries
//! referencing them. On the wire it is serialized with `bincode` and sealed with
//! XChaCha20-Poly1305; the random nonce is prepended to the ciphertext.
//!
//! Output format: nonce (24 bytes) || ciphertext || tag (16 bytes)

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use reliquary_types::{
    constants::{BLOCK_SALT_LEN, SHARD_COMPRESSION_LEVEL},
    data::{JournalEntry, ShardHash},
    error::BlockError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the XChaCha20 nonce
const NONCE_LEN: usize = 24;

/// Length of the Poly1305 tag
const TAG_LEN: usize = 16;

/// Symmetric key every node of a backup set derives from the shared passphrase
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    /// Derive the key as the SHA-256 digest of the passphrase
    #[must_use]
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self(Sha256::digest(passphrase.as_bytes()).into())
    }

    /// Cipher keyed with this key
    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// A shard as it sits inside a block
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PackedShard {
    /// Hash of the uncompressed content
    hash: ShardHash,
    /// Whether `data` is zstd compressed
    compressed: bool,
    /// The (possibly compressed) content
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

impl PackedShard {
    /// Compress a shard, keeping it raw when compression does not pay off
    fn pack(hash: ShardHash, content: &[u8]) -> Result<Self, BlockError> {
        let compressed = zstd::encode_all(content, SHARD_COMPRESSION_LEVEL)
            .map_err(|_| BlockError::Compression(hash))?;
        Ok(if compressed.len() < content.len() {
            Self {
                hash,
                compressed: true,
                data: compressed,
            }
        } else {
            Self {
                hash,
                compressed: false,
                data: content.to_vec(),
            }
        })
    }

    /// Recover the shard content and check it against the recorded hash
    fn unpack(self) -> Result<(ShardHash, Vec<u8>), BlockError> {
        let content = if self.compressed {
            zstd::decode_all(self.data.as_slice())
                .map_err(|_| BlockError::Decompression(self.hash))?
        } else {
            self.data
        };
        if !self.hash.matches(&content) {
            return Err(BlockError::ShardMismatch(self.hash));
        }
        Ok((self.hash, content))
    }
}

/// An unsealed block
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Random salt, so that equal shard sets never produce equal blocks
    salt: [u8; BLOCK_SALT_LEN],
    /// The packed shards
    shards: Vec<PackedShard>,
    /// Journal entries referencing the shards
    file_history: Vec<JournalEntry>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("shards", &self.shards.len())
            .field("file_history", &self.file_history.len())
            .finish_non_exhaustive()
    }
}

/// The contents of a block after opening it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenedBlock {
    /// Shard content by hash
    pub shards: BTreeMap<ShardHash, Vec<u8>>,
    /// Journal entries that travelled with the shards
    pub file_history: Vec<JournalEntry>,
}

impl Block {
    /// Pack shards and their file history into a new block
    ///
    /// # Errors
    /// [`BlockError::Empty`] without shards, [`BlockError::ShardMismatch`] if some content does
    /// not hash to the hash it is given under, or a compression failure
    pub fn build(
        shards: &BTreeMap<ShardHash, Vec<u8>>,
        file_history: Vec<JournalEntry>,
    ) -> Result<Self, BlockError> {
        if shards.is_empty() {
            return Err(BlockError::Empty);
        }
        let mut salt = [0u8; BLOCK_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let shards = shards
            .iter()
            .map(|(hash, content)| {
                if !hash.matches(content) {
                    return Err(BlockError::ShardMismatch(*hash));
                }
                PackedShard::pack(*hash, content)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            salt,
            shards,
            file_history,
        })
    }

    /// Hashes of the shards in this block
    #[must_use]
    pub fn shard_hashes(&self) -> BTreeSet<ShardHash> {
        self.shards.iter().map(|shard| shard.hash).collect()
    }

    /// Journal entries packed with the shards
    #[must_use]
    pub fn file_history(&self) -> &[JournalEntry] {
        &self.file_history
    }

    /// Serialize and seal the block
    ///
    /// # Errors
    /// If serialization or encryption fails
    pub fn to_bytes(&self, key: &SharedKey) -> Result<Vec<u8>, BlockError> {
        let plaintext = bincode::serialize(self)?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = key
            .cipher()
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| BlockError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Unseal and deserialize a block without unpacking its shards
    ///
    /// # Errors
    /// If the bytes are truncated, fail authentication, or are not a block
    pub fn from_bytes(bytes: &[u8], key: &SharedKey) -> Result<Self, BlockError> {
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(BlockError::Truncated(bytes.len()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = key
            .cipher()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| BlockError::Decryption)?;
        Ok(bincode::deserialize(&plaintext)?)
    }

    /// Unseal a block and unpack every shard
    ///
    /// Either every shard decodes and matches its hash, or the whole block is rejected.
    ///
    /// # Errors
    /// Any [`BlockError`] from unsealing, decompression or hash verification
    pub fn open(bytes: &[u8], key: &SharedKey) -> Result<OpenedBlock, BlockError> {
        let block = Self::from_bytes(bytes, key)?;
        let shards = block
            .shards
            .into_iter()
            .map(PackedShard::unpack)
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        if shards.is_empty() {
            return Err(BlockError::Empty);
        }
        Ok(OpenedBlock {
            shards,
            file_history: block.file_history,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use reliquary_types::data::ContentHash;

    use super::*;

    fn shard_map(contents: &[&[u8]]) -> BTreeMap<ShardHash, Vec<u8>> {
        contents
            .iter()
            .map(|content| (ContentHash::of(content), content.to_vec()))
            .collect()
    }

    fn entry(path: &str, shards: Vec<ShardHash>) -> JournalEntry {
        JournalEntry {
            path: path.to_string(),
            version: 1,
            modified: Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap(),
            shards,
        }
    }

    #[test]
    fn sealed_block_opens_to_its_contents() {
        let key = SharedKey::from_passphrase("correct horse");
        let repetitive = vec![7u8; 4096];
        let random: Vec<u8> = (0..512u32).map(|i| (i * 7919 % 251) as u8).collect();
        let shards = shard_map(&[&repetitive, &random, b"x"]);
        let history = vec![entry("a.txt", shards.keys().copied().collect())];

        let block = Block::build(&shards, history.clone()).unwrap();
        assert_eq!(block.shard_hashes(), shards.keys().copied().collect());
        let bytes = block.to_bytes(&key).unwrap();
        let opened = Block::open(&bytes, &key).unwrap();

        assert_eq!(opened.shards, shards);
        assert_eq!(opened.file_history, history);
    }

    #[test]
    fn compression_is_skipped_when_it_does_not_help() {
        let repetitive = vec![0u8; 1024];
        let shards = shard_map(&[&repetitive, b"ab"]);
        let block = Block::build(&shards, vec![]).unwrap();
        for shard in &block.shards {
            assert_eq!(shard.compressed, shard.hash == ContentHash::of(&repetitive));
        }
    }

    #[test]
    fn equal_contents_produce_distinct_blocks() {
        let key = SharedKey::from_passphrase("pw");
        let shards = shard_map(&[b"same"]);
        let a = Block::build(&shards, vec![]).unwrap().to_bytes(&key).unwrap();
        let b = Block::build(&shards, vec![]).unwrap().to_bytes(&key).unwrap();
        assert_ne!(ContentHash::of(&a), ContentHash::of(&b));
    }

    #[test]
    fn wrong_key_or_tampering_is_rejected() {
        let key = SharedKey::from_passphrase("pw");
        let bytes = Block::build(&shard_map(&[b"payload"]), vec![])
            .unwrap()
            .to_bytes(&key)
            .unwrap();

        assert!(matches!(
            Block::open(&bytes, &SharedKey::from_passphrase("other")),
            Err(BlockError::Decryption)
        ));

        let mut tampered = bytes.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(matches!(
            Block::open(&tampered, &key),
            Err(BlockError::Decryption)
        ));

        assert!(matches!(
            Block::open(&bytes[..10], &key),
            Err(BlockError::Truncated(10))
        ));
    }

    #[test]
    fn build_rejects_mislabelled_or_missing_shards() {
        let mut shards = BTreeMap::new();
        shards.insert(ContentHash::of(b"one"), b"two".to_vec());
        assert!(matches!(
            Block::build(&shards, vec![]),
            Err(BlockError::ShardMismatch(_))
        ));
        assert!(matches!(
            Block::build(&BTreeMap::new(), vec![]),
            Err(BlockError::Empty)
        ));
    }

    #[test]
    fn shard_mismatch_inside_a_sealed_block_fails_the_whole_block() {
        let key = SharedKey::from_passphrase("pw");
        let mut block = Block::build(&shard_map(&[b"good", b"also good"]), vec![]).unwrap();
        block.shards[1].compressed = false;
        block.shards[1].data = b"forged".to_vec();
        let bytes = block.to_bytes(&key).unwrap();
        assert!(matches!(
            Block::open(&bytes, &key),
            Err(BlockError::ShardMismatch(_))
        ));
    }
}
