//! Passphrase-based encryption for archive entries.
//!
//! Keys are derived with Argon2id from the passphrase and a random salt that is
//! stored in the archive header. Entry payloads are sealed with AES-256-GCM in
//! fixed-size frames so arbitrarily large sources stream through bounded
//! memory. Each frame nonce is `prefix(7) || counter(4, BE) || last(1)`, so a
//! stream that was reordered or cut short fails authentication.
//!
//! Frame layout on disk: `last(1) || len(4, BE) || ciphertext(len)`, preceded
//! once by the 7-byte nonce prefix.

use crate::utils::{BackupError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

pub const CIPHER_NAME: &str = "aes-256-gcm";
pub const KDF_NAME: &str = "argon2id";

const KEY_SIZE: usize = 32;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const NONCE_PREFIX_SIZE: usize = 7;
const TAG_SIZE: usize = 16;

/// Plaintext bytes per frame.
pub const FRAME_SIZE: usize = 64 * 1024;

const VERIFIER_PLAINTEXT: &[u8] = b"backup-core passphrase verifier";

/// Unencrypted key material description stored in the archive header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoHeader {
    pub cipher: String,
    pub kdf: String,
    /// Hex-encoded KDF salt.
    pub salt: String,
    /// Hex-encoded nonce used for `verifier`.
    pub verifier_nonce: String,
    /// Hex-encoded AES-GCM sealing of a known constant; opening it proves the
    /// passphrase is right before any payload is touched.
    pub verifier: String,
}

/// Symmetric key for one archive. Never persisted.
#[derive(Clone)]
pub struct ArchiveKey {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ArchiveKey(..)")
    }
}

impl ArchiveKey {
    fn derive(passphrase: &str, salt: &[u8]) -> Result<Self> {
        let mut key = [0u8; KEY_SIZE];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| BackupError::CorruptArchive(format!("key derivation failed: {}", e)))?;
        Ok(Self { key })
    }

    /// Derive a key for a new archive and describe it for the header.
    pub fn generate(passphrase: &str) -> Result<(Self, CryptoHeader)> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let key = Self::derive(passphrase, &salt)?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let verifier = key
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), VERIFIER_PLAINTEXT)
            .map_err(|e| BackupError::CorruptArchive(format!("encryption failed: {}", e)))?;

        let header = CryptoHeader {
            cipher: CIPHER_NAME.to_string(),
            kdf: KDF_NAME.to_string(),
            salt: hex::encode(salt),
            verifier_nonce: hex::encode(nonce),
            verifier: hex::encode(verifier),
        };
        Ok((key, header))
    }

    /// Re-derive the key of an existing archive.
    ///
    /// Fails with `InvalidPassphrase` when the verifier does not open and with
    /// `CorruptArchive` when the header itself is malformed.
    pub fn unlock(passphrase: &str, header: &CryptoHeader, label: &str) -> Result<Self> {
        if header.cipher != CIPHER_NAME || header.kdf != KDF_NAME {
            return Err(BackupError::CorruptArchive(format!(
                "unsupported encryption {}/{}",
                header.cipher, header.kdf
            )));
        }
        let salt = decode_hex(&header.salt, "salt")?;
        let nonce = decode_hex(&header.verifier_nonce, "verifier nonce")?;
        let verifier = decode_hex(&header.verifier, "verifier")?;
        if nonce.len() != NONCE_SIZE {
            return Err(BackupError::CorruptArchive("verifier nonce has wrong length".into()));
        }

        let key = Self::derive(passphrase, &salt)?;
        match key.cipher().decrypt(Nonce::from_slice(&nonce), verifier.as_slice()) {
            Ok(plain) if plain == VERIFIER_PLAINTEXT => Ok(key),
            _ => Err(BackupError::InvalidPassphrase(label.to_string())),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new((&self.key).into())
    }
}

fn decode_hex(value: &str, what: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|_| BackupError::CorruptArchive(format!("malformed {}", what)))
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], counter: u32, last: bool) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..NONCE_SIZE - 1].copy_from_slice(&counter.to_be_bytes());
    nonce[NONCE_SIZE - 1] = u8::from(last);
    nonce
}

/// Streaming encryptor. Call [`EncryptWriter::finish`] to seal the last frame.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    prefix: [u8; NONCE_PREFIX_SIZE],
    counter: u32,
    buffer: Vec<u8>,
    wrote_prefix: bool,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(inner: W, key: &ArchiveKey) -> Self {
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        rand::thread_rng().fill_bytes(&mut prefix);
        Self {
            inner,
            cipher: key.cipher(),
            prefix,
            counter: 0,
            buffer: Vec::with_capacity(FRAME_SIZE),
            wrote_prefix: false,
        }
    }

    fn seal_frame(&mut self, last: bool) -> io::Result<()> {
        if !self.wrote_prefix {
            self.inner.write_all(&self.prefix)?;
            self.wrote_prefix = true;
        }
        let nonce = frame_nonce(&self.prefix, self.counter, last);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), self.buffer.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("encryption failed: {}", e)))?;
        self.inner.write_all(&[u8::from(last)])?;
        self.inner.write_all(&(sealed.len() as u32).to_be_bytes())?;
        self.inner.write_all(&sealed)?;
        self.buffer.clear();
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "frame counter overflow"))?;
        Ok(())
    }

    /// Seal the remaining buffered bytes as the final frame.
    pub fn finish(mut self) -> io::Result<W> {
        self.seal_frame(true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = FRAME_SIZE - self.buffer.len();
        let take = room.min(buf.len());
        self.buffer.extend_from_slice(&buf[..take]);
        if self.buffer.len() == FRAME_SIZE {
            self.seal_frame(false)?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming decryptor over a sealed entry.
///
/// Authentication failures and truncation surface as `InvalidData`.
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    prefix: Option<[u8; NONCE_PREFIX_SIZE]>,
    counter: u32,
    plain: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(inner: R, key: &ArchiveKey) -> Self {
        Self {
            inner,
            cipher: key.cipher(),
            prefix: None,
            counter: 0,
            plain: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    fn open_frame(&mut self) -> io::Result<()> {
        let prefix = match self.prefix {
            Some(prefix) => prefix,
            None => {
                let mut prefix = [0u8; NONCE_PREFIX_SIZE];
                read_exact_or_truncated(&mut self.inner, &mut prefix)?;
                self.prefix = Some(prefix);
                prefix
            }
        };

        let mut frame_header = [0u8; 5];
        read_exact_or_truncated(&mut self.inner, &mut frame_header)?;
        let last = match frame_header[0] {
            0 => false,
            1 => true,
            _ => return Err(invalid_data("bad frame marker")),
        };
        let len = u32::from_be_bytes([frame_header[1], frame_header[2], frame_header[3], frame_header[4]])
            as usize;
        if len < TAG_SIZE || len > FRAME_SIZE + TAG_SIZE {
            return Err(invalid_data("bad frame length"));
        }

        let mut sealed = vec![0u8; len];
        read_exact_or_truncated(&mut self.inner, &mut sealed)?;
        let nonce = frame_nonce(&prefix, self.counter, last);
        self.plain = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| invalid_data("frame failed authentication"))?;
        self.pos = 0;
        self.counter = self.counter.wrapping_add(1);

        if last {
            self.finished = true;
            let mut probe = [0u8; 1];
            if self.inner.read(&mut probe)? != 0 {
                return Err(invalid_data("data after final frame"));
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.finished {
                return Ok(0);
            }
            self.open_frame()?;
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => invalid_data("encrypted stream is truncated"),
        _ => e,
    })
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seal(key: &ArchiveKey, data: &[u8]) -> Vec<u8> {
        let mut writer = EncryptWriter::new(Vec::new(), key);
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    fn open(key: &ArchiveKey, sealed: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        DecryptReader::new(sealed, key).read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_unlock_with_right_and_wrong_passphrase() {
        let (_, header) = ArchiveKey::generate("correct horse").unwrap();
        assert!(ArchiveKey::unlock("correct horse", &header, "test").is_ok());
        let err = ArchiveKey::unlock("battery staple", &header, "test").unwrap_err();
        assert!(matches!(err, BackupError::InvalidPassphrase(_)));
    }

    #[test]
    fn test_multi_frame_stream() {
        let (key, _) = ArchiveKey::generate("secret").unwrap();
        let data: Vec<u8> = (0..(FRAME_SIZE * 2 + 123)).map(|i| (i % 251) as u8).collect();
        let sealed = seal(&key, &data);
        assert_eq!(open(&key, &sealed).unwrap(), data);
    }

    #[test]
    fn test_empty_stream_still_has_final_frame() {
        let (key, _) = ArchiveKey::generate("secret").unwrap();
        let sealed = seal(&key, b"");
        assert_eq!(sealed.len(), NONCE_PREFIX_SIZE + 5 + TAG_SIZE);
        assert!(open(&key, &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_stream_is_rejected() {
        let (key, _) = ArchiveKey::generate("secret").unwrap();
        let data = vec![7u8; FRAME_SIZE + 10];
        let sealed = seal(&key, &data);
        let cut = &sealed[..sealed.len() - 20];
        let err = open(&key, cut).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_tampered_frame_is_rejected() {
        let (key, _) = ArchiveKey::generate("secret").unwrap();
        let mut sealed = seal(&key, b"configuration: true");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(open(&key, &sealed).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
