//! RSA helpers: fixed-key signature checks, OAEP title-key unwrapping and
//! private-key recovery.
//!
//! Every public key used by the format has exponent 65537. Signature checks
//! return a [`Validity`] and never fail on a bad signature; only malformed
//! key material is an error.

use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::crypto::sha256;
use crate::integrity::Validity;
use crate::{Error, Result};

/// Public exponent shared by all Switch RSA keys.
pub const PUBLIC_EXPONENT: u32 = 65537;

/// Witnesses tried by [`recover_key`] before giving up.
pub const MAX_RECOVERY_ATTEMPTS: usize = 100;

fn public_key(modulus: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from(PUBLIC_EXPONENT),
    )
    .map_err(|_| Error::Crypto("invalid RSA modulus"))
}

/// Verify an RSASSA-PKCS1-v1_5 / SHA-256 signature over `message`.
pub fn verify_pkcs1v15(modulus: &[u8], message: &[u8], signature: &[u8]) -> Result<Validity> {
    let key = public_key(modulus)?;
    let hashed = sha256(message);
    Ok(match key.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, signature) {
        Ok(()) => Validity::Valid,
        Err(_) => Validity::Invalid,
    })
}

/// Verify an RSASSA-PSS / SHA-256 signature over `message`.
pub fn verify_pss(modulus: &[u8], message: &[u8], signature: &[u8]) -> Result<Validity> {
    let key = public_key(modulus)?;
    let hashed = sha256(message);
    Ok(match key.verify(Pss::new::<Sha256>(), &hashed, signature) {
        Ok(()) => Validity::Valid,
        Err(_) => Validity::Invalid,
    })
}

/// A complete RSA private key, as reconstructed by [`recover_key`].
#[derive(Clone)]
pub struct RsaKeyParams {
    pub n: BigUint,
    pub e: BigUint,
    pub d: BigUint,
    pub p: BigUint,
    pub q: BigUint,
    pub dp: BigUint,
    pub dq: BigUint,
    pub q_inv: BigUint,
}

impl std::fmt::Debug for RsaKeyParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeyParams")
            .field("bits", &self.n.bits())
            .finish_non_exhaustive()
    }
}

impl RsaKeyParams {
    /// Build an [`RsaPrivateKey`] for decryption and signing.
    pub fn to_private_key(&self) -> Result<RsaPrivateKey> {
        let mut key = RsaPrivateKey::from_components(
            self.n.clone(),
            self.e.clone(),
            self.d.clone(),
            vec![self.p.clone(), self.q.clone()],
        )
        .map_err(|_| Error::Crypto("recovered RSA parameters are inconsistent"))?;
        key.precompute()
            .map_err(|_| Error::Crypto("recovered RSA parameters are inconsistent"))?;
        Ok(key)
    }

    /// Modulus as big-endian bytes.
    pub fn modulus_bytes(&self) -> Vec<u8> {
        self.n.to_bytes_be()
    }
}

/// Decrypt an RSA-OAEP (SHA-256, empty label) ciphertext.
pub fn decrypt_oaep(key: &RsaKeyParams, ciphertext: &[u8]) -> Result<Vec<u8>> {
    key.to_private_key()?
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|_| Error::Crypto("RSA-OAEP decryption failed"))
}

fn is_even(v: &BigUint) -> bool {
    v.to_bytes_le()[0] & 1 == 0
}

fn gcd(a: &BigUint, b: &BigUint) -> BigUint {
    let zero = BigUint::from(0u32);
    let (mut a, mut b) = (a.clone(), b.clone());
    while b != zero {
        let r = &a % &b;
        a = b;
        b = r;
    }
    a
}

// Uniform enough witness in [2, n - 2].
fn random_witness(n: &BigUint, rng: &mut impl RngCore) -> BigUint {
    let mut bytes = vec![0u8; n.to_bytes_be().len()];
    rng.fill_bytes(&mut bytes);
    let span = n - BigUint::from(3u32);
    BigUint::from_bytes_be(&bytes) % span + BigUint::from(2u32)
}

/// Recover the prime factors and CRT parameters of an RSA key from
/// `(n, e, d)`.
///
/// `e * d - 1` is a multiple of `λ(n)`; writing it as `2^t * r` with `r`
/// odd, a random witness `g` raised to `r` and squared repeatedly modulo `n`
/// reaches a nontrivial square root of 1 with probability at least 1/2, and
/// `gcd(root - 1, n)` is then a factor. Up to [`MAX_RECOVERY_ATTEMPTS`]
/// witnesses are tried.
pub fn recover_key(n: &[u8], e: &[u8], d: &[u8]) -> Result<RsaKeyParams> {
    recover_key_with_rng(n, e, d, &mut rand::thread_rng())
}

/// [`recover_key`] with a caller-supplied random source.
pub fn recover_key_with_rng(n: &[u8], e: &[u8], d: &[u8], rng: &mut impl RngCore) -> Result<RsaKeyParams> {
    let n = BigUint::from_bytes_be(n);
    let e = BigUint::from_bytes_be(e);
    let d = BigUint::from_bytes_be(d);
    let one = BigUint::from(1u32);

    if n <= BigUint::from(3u32) || is_even(&n) || e <= one || d <= one {
        return Err(Error::Crypto("RSA parameters out of range"));
    }

    let k = &e * &d - &one;
    if !is_even(&k) {
        return Err(Error::FactorizationFailed);
    }
    let mut r = k;
    let mut t = 0u32;
    while is_even(&r) {
        r = r >> 1usize;
        t += 1;
    }

    let n_minus_one = &n - &one;
    for _ in 0..MAX_RECOVERY_ATTEMPTS {
        let g = random_witness(&n, rng);
        let mut y = g.modpow(&r, &n);
        if y == one || y == n_minus_one {
            continue;
        }
        // y = g^(r·2^j); the last squaring reaches g^(e·d - 1) = 1.
        for _ in 0..t {
            let x = y.modpow(&BigUint::from(2u32), &n);
            if x == one {
                let p = gcd(&(&y - &one), &n);
                if p != one && p != n {
                    return Ok(finish_recovery(n, e, d, p));
                }
                break;
            }
            if x == n_minus_one {
                break;
            }
            y = x;
        }
    }

    tracing::warn!("RSA key recovery gave up after {MAX_RECOVERY_ATTEMPTS} witnesses");
    Err(Error::FactorizationFailed)
}

fn finish_recovery(n: BigUint, e: BigUint, d: BigUint, p: BigUint) -> RsaKeyParams {
    let one = BigUint::from(1u32);
    let q = &n / &p;
    let (p, q) = if p > q { (p, q) } else { (q, p) };
    let dp = &d % (&p - &one);
    let dq = &d % (&q - &one);
    // p is prime, so q^(p-2) is the inverse of q modulo p.
    let q_inv = q.modpow(&(&p - BigUint::from(2u32)), &p);
    RsaKeyParams {
        n,
        e,
        d,
        p,
        q,
        dp,
        dq,
        q_inv,
    }
}

/// Returns the byte length of the modulus in a key's public half.
pub fn modulus_len(key: &RsaKeyParams) -> usize {
    RsaPublicKey::new(key.n.clone(), key.e.clone())
        .map(|k| k.size())
        .unwrap_or_else(|_| key.n.to_bytes_be().len())
}
