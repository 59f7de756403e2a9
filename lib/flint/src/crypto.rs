use num_bigint::BigUint;
use rand::RngCore;

/// Width of the agreed modulus in bytes. All wire keys have exactly this length.
pub const P_LEN: usize = 16;

/// Generator agreed with the clicker firmware.
pub const GENERATOR: u32 = 2;

/// The agreed 128-bit modulus (2^127 - 1), big-endian.
pub const P_MODULUS: [u8; P_LEN] = [
    0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Source of private-exponent entropy. Returns false when no randomness
/// could be produced.
pub type Randomizer = Box<dyn FnMut(&mut [u8]) -> bool + Send>;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Eq, PartialEq)]
pub enum CryptoError {
    /// The randomizer could not produce a private exponent.
    RandomSource,
    /// `complete` was called before `generate_local`.
    MissingPrivateKey,
    /// The peer public key is shorter than the modulus width.
    KeyTooShort,
}

/// Returns a randomizer backed by the thread-local RNG.
pub fn default_randomizer() -> Randomizer {
    Box::new(|buf| {
        rand::thread_rng().fill_bytes(buf);
        true
    })
}

/// Diffie-Hellman exchange context for a single clicker. Binds the agreed
/// prime, the generator and the private exponent drawn on the first call
/// to `generate_local`.
pub struct KeyExchanger {
    modulus: BigUint,
    generator: BigUint,
    width: usize,
    x: Option<BigUint>,
    randomizer: Randomizer,
}

impl KeyExchanger {
    pub fn new(p_bytes: &[u8], g: u32, randomizer: Randomizer) -> KeyExchanger {
        KeyExchanger {
            modulus: BigUint::from_bytes_be(p_bytes),
            generator: BigUint::from(g),
            width: p_bytes.len(),
            x: None,
            randomizer,
        }
    }

    /// Draws a fresh private exponent and returns the public key
    /// `g^x mod p` as a big-endian string of exactly the modulus width.
    pub fn generate_local(&mut self) -> CryptoResult<Vec<u8>> {
        let mut seed = vec![0u8; self.width];

        if !(self.randomizer)(&mut seed) {
            return Err(CryptoError::RandomSource);
        }

        let x = BigUint::from_bytes_be(&seed);
        let public = self.generator.modpow(&x, &self.modulus);
        self.x = Some(x);

        Ok(self.to_wire(&public))
    }

    /// Derives the shared secret `peer^x mod p` from the peer's public key.
    pub fn complete(&self, peer: &[u8]) -> CryptoResult<Vec<u8>> {
        if peer.len() < self.width {
            return Err(CryptoError::KeyTooShort);
        }

        let x = self.x.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        let shared = BigUint::from_bytes_be(peer).modpow(x, &self.modulus);

        Ok(self.to_wire(&shared))
    }

    /// Big-endian encoding left-padded to the modulus width.
    fn to_wire(&self, value: &BigUint) -> Vec<u8> {
        let raw = value.to_bytes_be();
        let mut out = vec![0u8; self.width];
        out[self.width - raw.len()..].copy_from_slice(&raw);
        out
    }
}
