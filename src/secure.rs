use std::fmt;

use aes::{
    cipher::{AsyncStreamCipher, KeyIvInit},
    Aes256,
};
use rand::{rngs::OsRng, RngCore};

type Aes256CfbEncryptor = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDecryptor = cfb_mode::Decryptor<Aes256>;


/// A credential kept encrypted while it sits in memory.
///
/// Every instance draws a fresh 256-bit AES key and a fresh 16-byte IV
/// and stores only the AES-CFB ciphertext of the input. This is
/// defence-in-depth against casual heap scraping, not a security
/// guarantee: the key lives in the same process. Zeroing the input bytes
/// after construction is the caller's responsibility.
pub struct SecureString {
    key: [u8; 32],
    iv: [u8; 16],
    ciphertext: Vec<u8>,
}

impl SecureString {
    pub fn new(plaintext: &[u8]) -> Self {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);

        let mut ciphertext = plaintext.to_vec();
        Aes256CfbEncryptor::new(&key.into(), &iv.into()).encrypt(&mut ciphertext);

        Self {
            key,
            iv,
            ciphertext,
        }
    }

    /// Decrypt into a fresh plaintext vector.
    pub fn decrypt(&self) -> Vec<u8> {
        let mut plaintext = self.ciphertext.clone();
        Aes256CfbDecryptor::new(&self.key.into(), &self.iv.into()).decrypt(&mut plaintext);
        plaintext
    }

    /// Length of the protected credential in bytes.
    pub fn len(&self) -> usize {
        self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureString")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
