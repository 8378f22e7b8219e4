//! Packet encryption. Every cipher works in place on a whole datagram laid
//! out as `[nonce 16][checksum 16][body]`: the nonce keys the cipher, the
//! checksum is a truncated BLAKE2s over `nonce || body-ciphertext` and is
//! verified before the cipher runs. A failed check means the datagram is
//! dropped; the sender retransmits.

use aes::{Aes128, Aes192, Aes256};
use blake2::{Blake2s256, Digest};
use cipher::generic_array::GenericArray;
use cipher::{KeyIvInit, StreamCipher};
use log::trace;
use rand::RngCore;
use salsa20::Salsa20;

use crate::err::Error;
use crate::metrics::{Metrics, SNMP};

pub const NONCE_SIZE: usize = 16;
pub const CHECKSUM_SIZE: usize = 16;

/// Bytes prepended to every datagram when a cipher is configured.
pub const CRYPT_HEADER_SIZE: usize = NONCE_SIZE + CHECKSUM_SIZE;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// A packet cipher. `encrypt` fills the 32-byte header and enciphers the
/// body; `decrypt` verifies the header and deciphers, or reports
/// [`Error::ChecksumMismatch`].
pub trait BlockCrypt: Send + Sync {
    fn encrypt(&self, buf: &mut [u8]);
    fn decrypt(&self, buf: &mut [u8]) -> Result<(), Error>;
}

fn checksum(nonce: &[u8], body: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut hasher = Blake2s256::new();
    hasher.update(nonce);
    hasher.update(body);
    let digest = hasher.finalize();
    digest[..CHECKSUM_SIZE].try_into().unwrap()
}

/// Shared framing: pick a nonce, cipher the body, stamp the checksum.
fn seal(buf: &mut [u8], apply: impl FnOnce(&[u8; NONCE_SIZE], &mut [u8])) {
    assert!(buf.len() >= CRYPT_HEADER_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    buf[..NONCE_SIZE].copy_from_slice(&nonce);

    let (_, rest) = buf.split_at_mut(NONCE_SIZE);
    let (check, body) = rest.split_at_mut(CHECKSUM_SIZE);
    apply(&nonce, body);
    check.copy_from_slice(&checksum(&nonce, body));
}

/// Shared framing: verify the checksum over the ciphertext, then decipher.
fn open(buf: &mut [u8], apply: impl FnOnce(&[u8; NONCE_SIZE], &mut [u8])) -> Result<(), Error> {
    if buf.len() < CRYPT_HEADER_SIZE {
        Metrics::incr(&SNMP.checksum_failures);
        return Err(Error::ChecksumMismatch);
    }
    let nonce: [u8; NONCE_SIZE] = buf[..NONCE_SIZE].try_into().unwrap();
    let (_, rest) = buf.split_at_mut(NONCE_SIZE);
    let (check, body) = rest.split_at_mut(CHECKSUM_SIZE);

    if checksum(&nonce, body) != check[..] {
        Metrics::incr(&SNMP.checksum_failures);
        trace!("dropping datagram with bad checksum ({} bytes)", body.len());
        return Err(Error::ChecksumMismatch);
    }
    apply(&nonce, body);
    Ok(())
}

/// Framing without a cipher: the body goes out in the clear, but still
/// nonce-tagged and checksum-protected.
pub struct NoneCrypt;

impl BlockCrypt for NoneCrypt {
    fn encrypt(&self, buf: &mut [u8]) {
        seal(buf, |_, _| {});
    }

    fn decrypt(&self, buf: &mut [u8]) -> Result<(), Error> {
        open(buf, |_, _| {})
    }
}

pub struct Salsa20Crypt {
    key: [u8; 32],
}

impl Salsa20Crypt {
    pub fn new(key: &[u8]) -> Result<Self, Error> {
        let key = key
            .try_into()
            .map_err(|_| Error::ConfigInvalid("salsa20 requires a 32-byte key"))?;
        Ok(Salsa20Crypt { key })
    }

    fn keystream(&self, nonce: &[u8; NONCE_SIZE], body: &mut [u8]) {
        let key = GenericArray::from_slice(&self.key);
        let iv = GenericArray::from_slice(&nonce[..8]);
        Salsa20::new(key, iv).apply_keystream(body);
    }
}

impl BlockCrypt for Salsa20Crypt {
    fn encrypt(&self, buf: &mut [u8]) {
        seal(buf, |nonce, body| self.keystream(nonce, body));
    }

    fn decrypt(&self, buf: &mut [u8]) -> Result<(), Error> {
        open(buf, |nonce, body| self.keystream(nonce, body))
    }
}

/// AES in CTR mode; the key length (16, 24 or 32 bytes) picks the variant.
pub struct AesCrypt {
    key: Vec<u8>,
}

impl AesCrypt {
    pub fn new(key: &[u8]) -> Result<Self, Error> {
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(Error::ConfigInvalid("aes requires a 16, 24 or 32-byte key"));
        }
        Ok(AesCrypt { key: key.to_vec() })
    }

    fn keystream(&self, nonce: &[u8; NONCE_SIZE], body: &mut [u8]) {
        let iv = GenericArray::from_slice(nonce);
        match self.key.len() {
            16 => Aes128Ctr::new(GenericArray::from_slice(&self.key), iv).apply_keystream(body),
            24 => Aes192Ctr::new(GenericArray::from_slice(&self.key), iv).apply_keystream(body),
            32 => Aes256Ctr::new(GenericArray::from_slice(&self.key), iv).apply_keystream(body),
            _ => unreachable!(),
        }
    }
}

impl BlockCrypt for AesCrypt {
    fn encrypt(&self, buf: &mut [u8]) {
        seal(buf, |nonce, body| self.keystream(nonce, body));
    }

    fn decrypt(&self, buf: &mut [u8]) -> Result<(), Error> {
        open(buf, |nonce, body| self.keystream(nonce, body))
    }
}

/// TEA with an 8-byte block, run as an OFB keystream seeded by the nonce
/// so that encryption and decryption are the same transform.
pub struct TeaCrypt {
    key: [u32; 4],
}

impl TeaCrypt {
    pub fn new(key: &[u8]) -> Result<Self, Error> {
        if key.len() != 16 {
            return Err(Error::ConfigInvalid("tea requires a 16-byte key"));
        }
        let mut k = [0u32; 4];
        for (i, chunk) in key.chunks_exact(4).enumerate() {
            k[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(TeaCrypt { key: k })
    }

    fn encrypt_block(&self, block: [u32; 2]) -> [u32; 2] {
        const DELTA: u32 = 0x9e37_79b9;
        let [mut v0, mut v1] = block;
        let [k0, k1, k2, k3] = self.key;
        let mut sum = 0u32;
        for _ in 0..32 {
            sum = sum.wrapping_add(DELTA);
            v0 = v0.wrapping_add(
                (v1 << 4).wrapping_add(k0) ^ v1.wrapping_add(sum) ^ (v1 >> 5).wrapping_add(k1),
            );
            v1 = v1.wrapping_add(
                (v0 << 4).wrapping_add(k2) ^ v0.wrapping_add(sum) ^ (v0 >> 5).wrapping_add(k3),
            );
        }
        [v0, v1]
    }

    fn keystream(&self, nonce: &[u8; NONCE_SIZE], body: &mut [u8]) {
        let mut state = [
            u32::from_le_bytes(nonce[0..4].try_into().unwrap()),
            u32::from_le_bytes(nonce[4..8].try_into().unwrap()),
        ];
        for chunk in body.chunks_mut(8) {
            state = self.encrypt_block(state);
            let ks = [state[0].to_le_bytes(), state[1].to_le_bytes()].concat();
            for (b, k) in chunk.iter_mut().zip(ks.iter()) {
                *b ^= k;
            }
        }
    }
}

impl BlockCrypt for TeaCrypt {
    fn encrypt(&self, buf: &mut [u8]) {
        seal(buf, |nonce, body| self.keystream(nonce, body));
    }

    fn decrypt(&self, buf: &mut [u8]) -> Result<(), Error> {
        open(buf, |nonce, body| self.keystream(nonce, body))
    }
}

/// XOR against a key-cycled pad. The weakest of the set, kept for paths
/// where obfuscation is the only requirement.
pub struct SimpleXorCrypt {
    pad: Vec<u8>,
}

impl SimpleXorCrypt {
    pub fn new(key: &[u8]) -> Result<Self, Error> {
        if key.is_empty() {
            return Err(Error::ConfigInvalid("xor requires a nonempty key"));
        }
        Ok(SimpleXorCrypt { pad: key.to_vec() })
    }

    fn apply(&self, body: &mut [u8]) {
        for (i, b) in body.iter_mut().enumerate() {
            *b ^= self.pad[i % self.pad.len()];
        }
    }
}

impl BlockCrypt for SimpleXorCrypt {
    fn encrypt(&self, buf: &mut [u8]) {
        seal(buf, |_, body| self.apply(body));
    }

    fn decrypt(&self, buf: &mut [u8]) -> Result<(), Error> {
        open(buf, |_, body| self.apply(body))
    }
}
