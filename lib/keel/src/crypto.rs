//! Stream ciphers for the three client wire dialects, plus the multi-key
//! detection wrapper used on Blue Burst connections.
//!
//! All three engines are XOR-style keystream ciphers over word-aligned
//! buffers: 4-byte words for the PC and GC engines, 8-byte blocks for the
//! Blue Burst engine. Encrypting and decrypting advance the same internal
//! state, so a cipher instance must only ever see one direction of traffic.

use crate::logging;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::sync::{Arc, Mutex};

pub const PC_STREAM_WORDS: usize = 57;
pub const GC_STREAM_WORDS: usize = 521;
pub const BB_STREAM_WORDS: usize = 1042;

pub const BB_SEED_SIZE: usize = 48;
pub const BB_KEY_FILE_SIZE: usize = (18 + 1024) * 4;

/// The first eight decrypted bytes of the first command a Blue Burst client
/// sends after the server's init command: a login command with a known size,
/// command code and flag.
pub const BB_EXPECTED_FIRST_BLOCK: [u8; 8] = [0xB4, 0x00, 0x93, 0x00, 0x00, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CryptoError {
    /// Buffer length is not a multiple of the cipher's block size.
    Misaligned { len: usize, block: usize },
    /// No candidate key produced the expected plaintext for the first
    /// Blue Burst command.
    DetectionFailed { attempts: usize },
    /// The outbound mirror was asked to encrypt before the inbound detector
    /// settled on a key.
    KeyNotDetected,
    /// A Blue Burst key file had the wrong size or could not be parsed.
    BadKeyFile { size: usize },
    /// A Blue Burst seed had the wrong size.
    BadSeed { size: usize },
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CryptoError::Misaligned { len, block } => {
                write!(f, "buffer length {} is not a multiple of {}", len, block)
            }
            CryptoError::DetectionFailed { attempts } => {
                write!(f, "no candidate key matched the first command ({} tried)", attempts)
            }
            CryptoError::KeyNotDetected => write!(f, "key detection has not completed"),
            CryptoError::BadKeyFile { size } => write!(f, "bad key file size {}", size),
            CryptoError::BadSeed { size } => write!(f, "bad seed size {}", size),
        }
    }
}

impl std::error::Error for CryptoError {}

/// One direction of an encrypted connection.
pub trait Cipher: Send {
    /// Granularity of the keystream; buffers handed to `encrypt`/`decrypt`
    /// must be sized in multiples of this.
    fn block_size(&self) -> usize {
        4
    }

    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError>;

    /// XOR keystream ciphers decrypt with the same state walk.
    fn decrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        self.encrypt(data)
    }
}

#[inline]
fn check_aligned(len: usize, block: usize) -> Result<(), CryptoError> {
    if len % block != 0 {
        return Err(CryptoError::Misaligned { len, block });
    }
    Ok(())
}

#[inline]
fn xor_words<F: FnMut() -> u32>(data: &mut [u8], mut next: F) {
    for chunk in data.chunks_exact_mut(4) {
        let word = LittleEndian::read_u32(chunk) ^ next();
        LittleEndian::write_u32(chunk, word);
    }
}

////////////////////////////////////////////////////////////////////////////////
// PC engine

/// The v1/v2/PC-era engine: a 57-word lagged subtractive generator seeded
/// from a single 32-bit value, mixed four times before the first output.
pub struct PcCipher {
    stream: [u32; PC_STREAM_WORDS],
    offset: usize,
}

impl PcCipher {
    pub fn new(seed: u32) -> PcCipher {
        let mut stream = [0u32; PC_STREAM_WORDS];
        let mut esi: u32 = 1;
        let mut ebx: u32 = seed;
        stream[56] = ebx;
        stream[55] = ebx;

        let mut edi: u32 = 0x15;
        while edi <= 0x46E {
            let index = (edi % 55) as usize;
            ebx = ebx.wrapping_sub(esi);
            edi += 0x15;
            stream[index] = esi;
            esi = ebx;
            ebx = stream[index];
        }

        let mut cipher = PcCipher { stream, offset: PC_STREAM_WORDS - 1 };
        for _ in 0..4 {
            cipher.mix();
        }
        cipher
    }

    fn mix(&mut self) {
        for x in 1..25 {
            self.stream[x] = self.stream[x].wrapping_sub(self.stream[x + 31]);
        }
        for x in 25..56 {
            self.stream[x] = self.stream[x].wrapping_sub(self.stream[x - 24]);
        }
    }

    fn next(&mut self) -> u32 {
        if self.offset == PC_STREAM_WORDS - 1 {
            self.mix();
            self.offset = 1;
        }
        let value = self.stream[self.offset];
        self.offset += 1;
        value
    }
}

impl Cipher for PcCipher {
    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        check_aligned(data.len(), 4)?;
        xor_words(data, || self.next());
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// GC engine

/// The GameCube-era engine: a 521-word shift-register generator. The seed is
/// stretched with a multiplicative walk, folded into the register, and mixed
/// three times before the first output.
pub struct GcCipher {
    stream: [u32; GC_STREAM_WORDS],
    offset: usize,
}

impl GcCipher {
    pub fn new(seed: u32) -> GcCipher {
        let mut stream = [0u32; GC_STREAM_WORDS];
        let mut key = seed;
        let mut basekey: u32 = 0;
        let mut index = 0;

        for _ in 0..17 {
            for _ in 0..32 {
                key = key.wrapping_mul(0x5D58_8B65).wrapping_add(1);
                basekey >>= 1;
                if key & 0x8000_0000 != 0 {
                    basekey |= 0x8000_0000;
                } else {
                    basekey &= 0x7FFF_FFFF;
                }
            }
            stream[index] = basekey;
            index += 1;
        }

        stream[index - 1] = (stream[0] >> 9) ^ (stream[index - 1] << 23) ^ stream[index - 2];

        let mut source1 = 0;
        let mut source2 = 1;
        let mut source3 = index - 1;
        while index < GC_STREAM_WORDS {
            stream[index] = stream[source3]
                ^ (((stream[source1] << 23) & 0xFF80_0000) ^ ((stream[source2] >> 9) & 0x007F_FFFF));
            index += 1;
            source1 += 1;
            source2 += 1;
            source3 += 1;
        }

        let mut cipher = GcCipher { stream, offset: GC_STREAM_WORDS - 1 };
        for _ in 0..3 {
            cipher.mix();
        }
        cipher
    }

    fn mix(&mut self) {
        for x in 0..32 {
            self.stream[x] ^= self.stream[489 + x];
        }
        for x in 32..GC_STREAM_WORDS {
            self.stream[x] ^= self.stream[x - 32];
        }
        self.offset = 0;
    }

    fn next(&mut self) -> u32 {
        self.offset += 1;
        if self.offset == GC_STREAM_WORDS {
            self.mix();
            self.offset = 1;
        }
        self.stream[self.offset]
    }
}

impl Cipher for GcCipher {
    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        check_aligned(data.len(), 4)?;
        xor_words(data, || self.next());
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Blue Burst engine

/// An on-disk Blue Burst key set: 18 subkey words and 1024 lookup words.
/// Differently-patched clients ship different key sets, so a server usually
/// holds several of these.
#[derive(Clone)]
pub struct BbKeyFile {
    pub initial_keys: [u32; 18],
    pub private_keys: [u32; 1024],
}

impl BbKeyFile {
    pub fn from_bytes(data: &[u8]) -> Result<BbKeyFile, CryptoError> {
        if data.len() != BB_KEY_FILE_SIZE {
            return Err(CryptoError::BadKeyFile { size: data.len() });
        }
        let mut initial_keys = [0u32; 18];
        let mut private_keys = [0u32; 1024];
        LittleEndian::read_u32_into(&data[..18 * 4], &mut initial_keys);
        LittleEndian::read_u32_into(&data[18 * 4..], &mut private_keys);
        Ok(BbKeyFile { initial_keys, private_keys })
    }
}

/// The Blue Burst engine: a Feistel network over 8-byte blocks whose
/// schedule is derived from a key file and a 48-byte per-connection seed.
/// Unlike the PC/GC engines, decryption walks the subkeys in reverse, so
/// `decrypt` is a distinct operation.
pub struct BbCipher {
    stream: [u32; BB_STREAM_WORDS],
}

impl BbCipher {
    pub fn new(key: &BbKeyFile, seed: &[u8]) -> Result<BbCipher, CryptoError> {
        if seed.len() != BB_SEED_SIZE {
            return Err(CryptoError::BadSeed { size: seed.len() });
        }

        // The raw seed is salted before use; the salt constants are fixed by
        // the client.
        let mut salted = [0u8; BB_SEED_SIZE];
        for (x, byte) in seed.iter().enumerate() {
            salted[x] = match x % 3 {
                0 => byte ^ 0x19,
                1 => byte ^ 0x16,
                _ => byte ^ 0x18,
            };
        }

        let mut stream = [0u32; BB_STREAM_WORDS];
        stream[..18].copy_from_slice(&key.initial_keys);
        stream[18..].copy_from_slice(&key.private_keys);

        // Fold the salted seed into the subkey block, walking it modularly.
        let mut pos = 0;
        for word in stream.iter_mut().take(18) {
            let folded = (u32::from(salted[pos]) << 24)
                | (u32::from(salted[(pos + 1) % BB_SEED_SIZE]) << 16)
                | (u32::from(salted[(pos + 2) % BB_SEED_SIZE]) << 8)
                | u32::from(salted[(pos + 3) % BB_SEED_SIZE]);
            pos = (pos + 4) % BB_SEED_SIZE;
            *word ^= folded;
        }

        // Run the engine over a zero block repeatedly, overwriting the whole
        // schedule with its own output.
        let mut left = 0u32;
        let mut right = 0u32;
        let mut x = 0;
        while x < BB_STREAM_WORDS {
            let (l, r) = Self::encipher_block(&stream, left, right);
            stream[x] = l;
            stream[x + 1] = r;
            left = l;
            right = r;
            x += 2;
        }

        Ok(BbCipher { stream })
    }

    #[inline]
    fn round(stream: &[u32; BB_STREAM_WORDS], x: u32) -> u32 {
        let a = stream[0x12 + (x >> 24) as usize];
        let b = stream[0x112 + ((x >> 16) & 0xFF) as usize];
        let c = stream[0x212 + ((x >> 8) & 0xFF) as usize];
        let d = stream[0x312 + (x & 0xFF) as usize];
        (a.wrapping_add(b) ^ c).wrapping_add(d)
    }

    fn encipher_block(stream: &[u32; BB_STREAM_WORDS], mut left: u32, mut right: u32) -> (u32, u32) {
        for x in 0..16 {
            left ^= stream[x];
            right ^= Self::round(stream, left);
            std::mem::swap(&mut left, &mut right);
        }
        std::mem::swap(&mut left, &mut right);
        right ^= stream[16];
        left ^= stream[17];
        (left, right)
    }

    fn decipher_block(stream: &[u32; BB_STREAM_WORDS], mut left: u32, mut right: u32) -> (u32, u32) {
        for x in (2..18).rev() {
            left ^= stream[x];
            right ^= Self::round(stream, left);
            std::mem::swap(&mut left, &mut right);
        }
        std::mem::swap(&mut left, &mut right);
        right ^= stream[1];
        left ^= stream[0];
        (left, right)
    }
}

impl Cipher for BbCipher {
    fn block_size(&self) -> usize {
        8
    }

    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        check_aligned(data.len(), 8)?;
        for block in data.chunks_exact_mut(8) {
            let left = LittleEndian::read_u32(&block[..4]);
            let right = LittleEndian::read_u32(&block[4..]);
            let (l, r) = Self::encipher_block(&self.stream, left, right);
            LittleEndian::write_u32(&mut block[..4], l);
            LittleEndian::write_u32(&mut block[4..], r);
        }
        Ok(())
    }

    fn decrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        check_aligned(data.len(), 8)?;
        for block in data.chunks_exact_mut(8) {
            let left = LittleEndian::read_u32(&block[..4]);
            let right = LittleEndian::read_u32(&block[4..]);
            let (l, r) = Self::decipher_block(&self.stream, left, right);
            LittleEndian::write_u32(&mut block[..4], l);
            LittleEndian::write_u32(&mut block[4..], r);
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Blue Burst multi-key detection

type SharedChoice = Arc<Mutex<Option<usize>>>;

/// Inbound wrapper that identifies which candidate key file the client is
/// using. The first received command is trial-decrypted with every candidate
/// until one yields the expected plaintext prefix; from then on the chosen
/// engine handles all traffic. The choice is published so the outbound
/// [`BbMirrorCipher`] can follow it.
pub struct BbDetectorCipher {
    candidates: Vec<Arc<BbKeyFile>>,
    seed: [u8; BB_SEED_SIZE],
    expected: [u8; 8],
    choice: SharedChoice,
    active: Option<BbCipher>,
    log: logging::Logger,
}

/// Outbound wrapper that mirrors the detector's key choice using the
/// server-side seed. Encrypting before detection has settled is an error;
/// in practice the server only sends after the client's first command has
/// been handled.
pub struct BbMirrorCipher {
    candidates: Vec<Arc<BbKeyFile>>,
    seed: [u8; BB_SEED_SIZE],
    choice: SharedChoice,
    active: Option<BbCipher>,
}

/// Builds the paired inbound detector and outbound mirror for one
/// Blue Burst connection.
pub fn bb_detector_pair(
    candidates: Vec<Arc<BbKeyFile>>,
    client_seed: [u8; BB_SEED_SIZE],
    server_seed: [u8; BB_SEED_SIZE],
    log: &logging::Logger,
) -> (BbDetectorCipher, BbMirrorCipher) {
    let choice: SharedChoice = Arc::new(Mutex::new(None));
    let detector = BbDetectorCipher {
        candidates: candidates.clone(),
        seed: client_seed,
        expected: BB_EXPECTED_FIRST_BLOCK,
        choice: choice.clone(),
        active: None,
        log: log.new(logging::o!("cipher" => "bb-detector")),
    };
    let mirror = BbMirrorCipher { candidates, seed: server_seed, choice, active: None };
    (detector, mirror)
}

impl BbDetectorCipher {
    /// Index of the chosen candidate, once detection has completed.
    pub fn chosen(&self) -> Option<usize> {
        *self.choice.lock().unwrap()
    }
}

impl Cipher for BbDetectorCipher {
    fn block_size(&self) -> usize {
        8
    }

    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        match self.active.as_mut() {
            Some(cipher) => cipher.encrypt(data),
            None => Err(CryptoError::KeyNotDetected),
        }
    }

    fn decrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        if let Some(cipher) = self.active.as_mut() {
            return cipher.decrypt(data);
        }

        check_aligned(data.len(), 8)?;
        if data.len() < 8 {
            return Err(CryptoError::Misaligned { len: data.len(), block: 8 });
        }

        let original = data.to_vec();
        for (index, key) in self.candidates.iter().enumerate() {
            let mut cipher = BbCipher::new(key, &self.seed)?;
            cipher.decrypt(data)?;
            if data[..8] == self.expected {
                logging::info!(self.log, "key detected"; "candidate" => index);
                *self.choice.lock().unwrap() = Some(index);
                self.active = Some(cipher);
                return Ok(());
            }
            logging::debug!(self.log, "candidate rejected"; "candidate" => index);
            data.copy_from_slice(&original);
        }

        Err(CryptoError::DetectionFailed { attempts: self.candidates.len() })
    }
}

impl BbMirrorCipher {
    fn activate(&mut self) -> Result<&mut BbCipher, CryptoError> {
        if self.active.is_none() {
            let index = self.choice.lock().unwrap().ok_or(CryptoError::KeyNotDetected)?;
            self.active = Some(BbCipher::new(&self.candidates[index], &self.seed)?);
        }
        Ok(self.active.as_mut().unwrap())
    }
}

impl Cipher for BbMirrorCipher {
    fn block_size(&self) -> usize {
        8
    }

    fn encrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        self.activate()?.encrypt(data)
    }

    fn decrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        self.activate()?.decrypt(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    fn test_key_file(tag: u32) -> BbKeyFile {
        let mut initial_keys = [0u32; 18];
        let mut private_keys = [0u32; 1024];
        for (x, word) in initial_keys.iter_mut().enumerate() {
            *word = tag.wrapping_mul(0x9E3779B9).wrapping_add(x as u32);
        }
        for (x, word) in private_keys.iter_mut().enumerate() {
            *word = tag.wrapping_mul(0x85EBCA6B).wrapping_add((x as u32) << 3);
        }
        BbKeyFile { initial_keys, private_keys }
    }

    #[test]
    fn pc_roundtrip() {
        let mut tx = PcCipher::new(0x12345678);
        let mut rx = PcCipher::new(0x12345678);
        let mut data = (0u8..64).collect::<Vec<_>>();
        let original = data.clone();
        tx.encrypt(&mut data).unwrap();
        assert_ne!(data, original);
        rx.decrypt(&mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn pc_chunked_keystream_matches_contiguous() {
        let mut whole = PcCipher::new(0x12345678);
        let mut chunked = PcCipher::new(0x12345678);

        let mut data_whole = [0u8; 16];
        whole.encrypt(&mut data_whole).unwrap();

        let mut data_chunked = [0u8; 16];
        for block in data_chunked.chunks_mut(4) {
            chunked.encrypt(block).unwrap();
        }
        assert_eq!(data_whole, data_chunked);
    }

    #[test]
    fn gc_roundtrip_and_determinism() {
        let mut a = GcCipher::new(0xDEADBEEF);
        let mut b = GcCipher::new(0xDEADBEEF);
        let mut data = [0u8; 32];
        let mut data2 = [0u8; 32];
        a.encrypt(&mut data).unwrap();
        b.encrypt(&mut data2).unwrap();
        assert_eq!(data, data2);

        let mut rx = GcCipher::new(0xDEADBEEF);
        rx.decrypt(&mut data).unwrap();
        assert_eq!(data, [0u8; 32]);
    }

    #[test]
    fn gc_long_stream_survives_state_mix() {
        // Push the generator past its 521-word register twice.
        let mut tx = GcCipher::new(7);
        let mut rx = GcCipher::new(7);
        let mut data = vec![0xA5u8; 521 * 4 * 2 + 64];
        let original = data.clone();
        tx.encrypt(&mut data).unwrap();
        rx.decrypt(&mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn misaligned_buffers_are_rejected() {
        let mut pc = PcCipher::new(1);
        assert_eq!(
            pc.encrypt(&mut [0u8; 6]),
            Err(CryptoError::Misaligned { len: 6, block: 4 })
        );

        let key = test_key_file(1);
        let mut bb = BbCipher::new(&key, &[0u8; BB_SEED_SIZE]).unwrap();
        assert_eq!(
            bb.encrypt(&mut [0u8; 12]),
            Err(CryptoError::Misaligned { len: 12, block: 8 })
        );
    }

    #[test]
    fn bb_roundtrip() {
        let key = test_key_file(3);
        let seed = [0x42u8; BB_SEED_SIZE];
        let mut tx = BbCipher::new(&key, &seed).unwrap();
        let mut rx = BbCipher::new(&key, &seed).unwrap();

        let mut data = (0u8..128).collect::<Vec<_>>();
        let original = data.clone();
        tx.encrypt(&mut data).unwrap();
        assert_ne!(data, original);
        rx.decrypt(&mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn bb_different_seeds_disagree() {
        let key = test_key_file(3);
        let mut a = BbCipher::new(&key, &[1u8; BB_SEED_SIZE]).unwrap();
        let mut b = BbCipher::new(&key, &[2u8; BB_SEED_SIZE]).unwrap();
        let mut data_a = [0u8; 16];
        let mut data_b = [0u8; 16];
        a.encrypt(&mut data_a).unwrap();
        b.encrypt(&mut data_b).unwrap();
        assert_ne!(data_a, data_b);
    }

    #[test]
    fn key_file_parse_checks_size() {
        assert!(BbKeyFile::from_bytes(&[0u8; 16]).is_err());
        let blob = vec![0u8; BB_KEY_FILE_SIZE];
        assert!(BbKeyFile::from_bytes(&blob).is_ok());
    }

    fn first_command_ciphertext(key: &BbKeyFile, seed: &[u8; BB_SEED_SIZE]) -> Vec<u8> {
        let mut data = vec![0u8; 0xB8];
        data[..8].copy_from_slice(&BB_EXPECTED_FIRST_BLOCK);
        let mut client = BbCipher::new(key, seed).unwrap();
        client.encrypt(&mut data).unwrap();
        data
    }

    #[test]
    fn detector_selects_the_key_in_use() {
        let candidates: Vec<_> = (0u32..3).map(|tag| Arc::new(test_key_file(tag))).collect();
        let client_seed = [0x11u8; BB_SEED_SIZE];
        let server_seed = [0x22u8; BB_SEED_SIZE];

        let mut data = first_command_ciphertext(&candidates[2], &client_seed);
        let (mut detector, mut mirror) =
            bb_detector_pair(candidates.clone(), client_seed, server_seed, &logging::discard());

        detector.decrypt(&mut data).unwrap();
        assert_eq!(&data[..8], &BB_EXPECTED_FIRST_BLOCK);
        assert_eq!(detector.chosen(), Some(2));

        // The mirror follows the detector's choice with the server seed.
        let mut reply = vec![0x5Au8; 16];
        let original = reply.clone();
        mirror.encrypt(&mut reply).unwrap();
        let mut reference = BbCipher::new(&candidates[2], &server_seed).unwrap();
        let mut expected = original;
        reference.encrypt(&mut expected).unwrap();
        assert_eq!(reply, expected);
    }

    #[test]
    fn detector_fails_deterministically_without_a_match() {
        let candidates: Vec<_> = (0u32..4).map(|tag| Arc::new(test_key_file(tag))).collect();
        let client_seed = [0x11u8; BB_SEED_SIZE];

        // Encrypted with a key that is not in the candidate set.
        let stranger = test_key_file(99);
        let mut data = first_command_ciphertext(&stranger, &client_seed);
        let saved = data.clone();

        let (mut detector, _mirror) =
            bb_detector_pair(candidates, client_seed, [0u8; BB_SEED_SIZE], &logging::discard());
        assert_eq!(
            detector.decrypt(&mut data),
            Err(CryptoError::DetectionFailed { attempts: 4 })
        );
        // The buffer is left untouched after a failed detection.
        assert_eq!(data, saved);
    }

    #[test]
    fn mirror_refuses_to_encrypt_before_detection() {
        let candidates = vec![Arc::new(test_key_file(0))];
        let (_detector, mut mirror) =
            bb_detector_pair(candidates, [0u8; BB_SEED_SIZE], [0u8; BB_SEED_SIZE], &logging::discard());
        assert_eq!(mirror.encrypt(&mut [0u8; 8]), Err(CryptoError::KeyNotDetected));
    }
}
