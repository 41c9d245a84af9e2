// Streaming AES-128-CBC decryption across arbitrary network chunk boundaries.

use aes::Aes128;
use bytes::Bytes;
use cipher::block_padding::{Padding, Pkcs7};
use cipher::generic_array::GenericArray;
use cipher::{Block, BlockDecryptMut, KeyIvInit};

use crate::DownloadError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const BLOCK_SIZE: usize = 16;

/// Incremental CBC decryptor.
///
/// Bytes that do not yet complete a block are carried into the next call. The
/// final full block is always held back as well, because it carries the PKCS#7
/// padding that [`finish`](Self::finish) strips. The carry never exceeds one block.
pub struct CbcStreamDecryptor {
    cipher: Aes128CbcDec,
    carry: Vec<u8>,
    consumed: u64,
}

impl CbcStreamDecryptor {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, DownloadError> {
        let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|_| {
            DownloadError::decryption(format!(
                "AES-128-CBC needs a {BLOCK_SIZE}-byte key and IV, got {} and {}",
                key.len(),
                iv.len()
            ))
        })?;
        Ok(Self {
            cipher,
            carry: Vec::with_capacity(BLOCK_SIZE),
            consumed: 0,
        })
    }

    /// Feed the next ciphertext chunk, returning whatever plaintext is now safe to emit.
    pub fn update(&mut self, chunk: &[u8]) -> Bytes {
        self.consumed += chunk.len() as u64;
        let total = self.carry.len() + chunk.len();
        let mut keep = total % BLOCK_SIZE;
        if keep == 0 && total > 0 {
            keep = BLOCK_SIZE;
        }
        let ready = total - keep;
        if ready == 0 {
            self.carry.extend_from_slice(chunk);
            return Bytes::new();
        }

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&self.carry);
        buf.extend_from_slice(chunk);

        self.carry.clear();
        self.carry.extend_from_slice(&buf[ready..]);
        buf.truncate(ready);

        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Bytes::from(buf)
    }

    /// Decrypt the held-back block and strip its padding.
    pub fn finish(mut self) -> Result<Bytes, DownloadError> {
        if self.carry.len() != BLOCK_SIZE {
            return Err(DownloadError::decryption(format!(
                "ciphertext of {} bytes is not a whole number of {BLOCK_SIZE}-byte blocks",
                self.consumed
            )));
        }

        let mut block: Block<Aes128CbcDec> = GenericArray::clone_from_slice(&self.carry);
        self.cipher.decrypt_block_mut(&mut block);
        let plain = Pkcs7::unpad(&block)
            .map_err(|_| DownloadError::decryption("invalid PKCS#7 padding in final block"))?;
        Ok(Bytes::copy_from_slice(plain))
    }

    /// Length of the pending carry-over, for diagnostics.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

/// Parse a hex IV, tolerating an optional `0x`/`0X` marker.
pub fn parse_iv(iv_hex: &str) -> Result<[u8; BLOCK_SIZE], DownloadError> {
    let digits = iv_hex
        .strip_prefix("0x")
        .or_else(|| iv_hex.strip_prefix("0X"))
        .unwrap_or(iv_hex);
    let mut iv = [0u8; BLOCK_SIZE];
    hex::decode_to_slice(digits, &mut iv)
        .map_err(|e| DownloadError::decryption(format!("failed to parse IV '{iv_hex}': {e}")))?;
    Ok(iv)
}

/// IV implied by a media sequence number when the manifest omits one.
pub fn iv_from_sequence(sequence: u64) -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    /// Encrypt `plaintext` with PKCS#7 padding.
    pub(crate) fn encrypt_data(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        use cipher::BlockEncryptMut;
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let padded_len = ((plaintext.len() / 16) + 1) * 16;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        let encrypted = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap();
        encrypted.to_vec()
    }

    fn decrypt_in_chunks(ciphertext: &[u8], sizes: &[usize], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let mut decryptor = CbcStreamDecryptor::new(key, iv).unwrap();
        let mut out = Vec::new();
        let mut rest = ciphertext;
        let mut i = 0;
        while !rest.is_empty() {
            let size = sizes[i % sizes.len()].clamp(1, rest.len());
            let (chunk, tail) = rest.split_at(size);
            out.extend_from_slice(&decryptor.update(chunk));
            assert!(decryptor.pending() <= BLOCK_SIZE);
            rest = tail;
            i += 1;
        }
        out.extend_from_slice(&decryptor.finish().unwrap());
        out
    }

    #[test]
    fn single_chunk_round_trip() {
        let key = [0x42; 16];
        let iv = [0x24; 16];
        let plaintext = b"Hello, World!!!";
        let encrypted = encrypt_data(plaintext, &key, &iv);
        let out = decrypt_in_chunks(&encrypted, &[encrypted.len()], &key, &iv);
        assert_eq!(out, plaintext);
    }

    #[test]
    fn misaligned_chunks_round_trip() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let plaintext: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let encrypted = encrypt_data(&plaintext, &key, &iv);
        let out = decrypt_in_chunks(&encrypted, &[7, 13, 1, 31, 100], &key, &iv);
        assert_eq!(out, plaintext);
    }

    #[test]
    fn block_aligned_plaintext_keeps_full_padding_block() {
        let key = [1u8; 16];
        let iv = [2u8; 16];
        let plaintext = [0xAB; 64];
        let encrypted = encrypt_data(&plaintext, &key, &iv);
        assert_eq!(encrypted.len(), 80);
        let out = decrypt_in_chunks(&encrypted, &[16], &key, &iv);
        assert_eq!(out, plaintext);
    }

    #[test]
    fn wrong_key_length_is_a_decryption_error() {
        let err = CbcStreamDecryptor::new(&[0u8; 15], &[0u8; 16])
            .err()
            .expect("15-byte key must be rejected");
        assert!(matches!(err, DownloadError::Decryption { .. }));
    }

    #[test]
    fn truncated_ciphertext_fails_on_finish() {
        let key = [3u8; 16];
        let iv = [4u8; 16];
        let encrypted = encrypt_data(b"some audio bytes here", &key, &iv);
        let mut decryptor = CbcStreamDecryptor::new(&key, &iv).unwrap();
        decryptor.update(&encrypted[..encrypted.len() - 5]);
        assert!(decryptor.finish().is_err());
    }

    #[test]
    fn empty_body_fails_on_finish() {
        let decryptor = CbcStreamDecryptor::new(&[0u8; 16], &[0u8; 16]).unwrap();
        assert!(decryptor.finish().is_err());
    }

    #[test]
    fn iv_parsing_strips_marker_but_not_leading_zeros() {
        let iv = parse_iv("0x000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(iv, core::array::from_fn::<u8, 16, _>(|i| i as u8));
        assert_eq!(parse_iv("0X000102030405060708090A0B0C0D0E0F").unwrap(), iv);
        assert_eq!(parse_iv("000102030405060708090a0b0c0d0e0f").unwrap(), iv);
        assert!(parse_iv("0x0102").is_err());
        assert!(parse_iv("zz").is_err());
    }

    #[test]
    fn sequence_iv_is_big_endian() {
        let iv = iv_from_sequence(0x0102);
        assert_eq!(&iv[..14], &[0u8; 14]);
        assert_eq!(&iv[14..], &[0x01, 0x02]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any chunking of the ciphertext reproduces the plaintext.
        #[test]
        fn prop_arbitrary_chunking_round_trips(
            plaintext in proptest::collection::vec(any::<u8>(), 0..2048),
            sizes in proptest::collection::vec(1usize..64, 1..16),
            key in any::<[u8; 16]>(),
            iv in any::<[u8; 16]>(),
        ) {
            let encrypted = encrypt_data(&plaintext, &key, &iv);
            let out = decrypt_in_chunks(&encrypted, &sizes, &key, &iv);
            prop_assert_eq!(out, plaintext);
        }
    }
}
