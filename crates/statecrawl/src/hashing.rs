//! Locality-sensitive fingerprints
//!
//! Implements the TLSH construction used to fingerprint endpoints,
//! interactions and states: a Pearson-permuted bucket histogram over sliding
//! 5-grams, quartile-coded into a 70-hex-character digest with a small
//! header (checksum, length bucket, quartile ratios). Inputs below the
//! minimum length or without enough bucket variance produce [`TNULL`].
//!
//! Every caller prepends a 200-character padding derived from the run seed;
//! the padding guarantees the minimum-entropy requirement, cancels out in
//! pairwise comparisons within a run, and differs between runs so clusters
//! never leak across batches.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// Digest emitted when the input has too little data or variance.
pub const TNULL: &str = "TNULL";

/// Length of the seeded padding prefix.
pub const PADDING_LEN: usize = 200;

const MIN_DATA_LENGTH: usize = 50;
const EFF_BUCKETS: usize = 128;
const CODE_SIZE: usize = 32;
const WINDOW: usize = 5;

const PADDING_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Pearson permutation table shared by the bucket mapping and the checksum.
const V_TABLE: [u8; 256] = [
    1, 87, 49, 12, 176, 178, 102, 166, 121, 193, 6, 84, 249, 230, 44, 163, 14, 197, 213, 181, 161,
    85, 218, 80, 64, 239, 24, 226, 236, 142, 38, 200, 110, 177, 104, 103, 141, 253, 255, 50, 77,
    101, 81, 18, 45, 96, 31, 222, 25, 107, 190, 70, 86, 237, 240, 34, 72, 242, 20, 214, 244, 227,
    149, 235, 97, 234, 57, 22, 60, 250, 82, 175, 208, 5, 127, 199, 111, 62, 135, 248, 174, 169,
    211, 58, 66, 154, 106, 195, 245, 171, 17, 187, 182, 179, 0, 243, 132, 56, 148, 75, 128, 133,
    158, 100, 130, 126, 91, 13, 153, 246, 216, 219, 119, 68, 223, 78, 83, 88, 201, 99, 122, 11,
    92, 32, 136, 114, 52, 10, 138, 30, 48, 183, 156, 35, 61, 26, 143, 74, 251, 94, 129, 162, 63,
    152, 170, 7, 115, 167, 241, 206, 3, 150, 55, 59, 151, 220, 90, 53, 23, 131, 125, 173, 15, 238,
    79, 95, 89, 16, 105, 137, 225, 224, 217, 160, 37, 123, 118, 73, 2, 157, 46, 116, 9, 145, 134,
    228, 207, 212, 202, 215, 69, 229, 27, 188, 67, 124, 168, 252, 42, 4, 29, 108, 21, 247, 19,
    205, 39, 203, 233, 40, 186, 147, 198, 192, 155, 33, 164, 191, 98, 204, 165, 180, 117, 76, 140,
    36, 210, 172, 41, 54, 159, 8, 185, 232, 113, 196, 231, 47, 146, 120, 51, 65, 28, 144, 254,
    221, 93, 189, 194, 139, 112, 43, 71, 109, 184, 209,
];

fn b_mapping(salt: u8, i: u8, j: u8, k: u8) -> u8 {
    let mut h = V_TABLE[salt as usize];
    h = V_TABLE[(h ^ i) as usize];
    h = V_TABLE[(h ^ j) as usize];
    V_TABLE[(h ^ k) as usize]
}

fn swap_nibbles(x: u8) -> u8 {
    (x << 4) | (x >> 4)
}

#[allow(clippy::cast_sign_loss)]
fn mod_diff(a: u8, b: u8, range: i64) -> u32 {
    let (a, b) = (i64::from(a), i64::from(b));
    let d1 = (a - b).rem_euclid(range);
    let d2 = (b - a).rem_euclid(range);
    d1.min(d2) as u32
}

/// Logarithmic bucketing of the input length into a single byte.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn l_capturing(len: usize) -> u8 {
    let len = len as f64;
    let i = if len <= 656.0 {
        (len.ln() / 1.5_f64.ln()).floor()
    } else if len <= 3199.0 {
        (len.ln() / 1.3_f64.ln() - 8.727_77).floor()
    } else {
        (len.ln() / 1.1_f64.ln() - 62.547_2).floor()
    };
    i.clamp(0.0, 255.0) as u8
}

fn quartiles(buckets: &[u32]) -> (u32, u32, u32) {
    let mut sorted = buckets.to_vec();
    sorted.sort_unstable();
    let quarter = sorted.len() / 4;
    (
        sorted[quarter - 1],
        sorted[2 * quarter - 1],
        sorted[3 * quarter - 1],
    )
}

/// A parsed TLSH digest: the three header bytes plus the 32-byte body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    checksum: u8,
    lvalue: u8,
    q1ratio: u8,
    q2ratio: u8,
    code: [u8; CODE_SIZE],
}

impl Digest {
    /// Compute the digest of a byte string, or `None` when the input is too
    /// short or too uniform to fingerprint.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn compute(data: &[u8]) -> Option<Self> {
        if data.len() < MIN_DATA_LENGTH {
            return None;
        }

        let mut buckets = [0u32; 256];
        let mut checksum = 0u8;
        for w in data.windows(WINDOW) {
            // Newest byte first, matching the reference sliding window.
            let (j0, j1, j2, j3, j4) = (w[4], w[3], w[2], w[1], w[0]);
            checksum = b_mapping(0, j0, j1, checksum);
            buckets[b_mapping(2, j0, j1, j2) as usize] += 1;
            buckets[b_mapping(3, j0, j1, j3) as usize] += 1;
            buckets[b_mapping(5, j0, j2, j3) as usize] += 1;
            buckets[b_mapping(7, j0, j2, j4) as usize] += 1;
            buckets[b_mapping(11, j0, j1, j4) as usize] += 1;
            buckets[b_mapping(13, j0, j3, j4) as usize] += 1;
        }

        let effective = &buckets[..EFF_BUCKETS];
        let (q1, q2, q3) = quartiles(effective);
        if q3 == 0 {
            return None;
        }
        let nonzero = effective.iter().filter(|&&b| b > 0).count();
        if nonzero <= EFF_BUCKETS / 2 {
            return None;
        }

        let mut code = [0u8; CODE_SIZE];
        for (i, chunk) in effective.chunks(4).enumerate() {
            let mut byte = 0u8;
            for (j, &bucket) in chunk.iter().enumerate() {
                let emb: u8 = if bucket <= q1 {
                    0
                } else if bucket <= q2 {
                    1
                } else if bucket <= q3 {
                    2
                } else {
                    3
                };
                byte |= emb << (j * 2);
            }
            code[i] = byte;
        }

        let ratio = |q: u32| ((f64::from(q) * 100.0 / f64::from(q3)) as u32 % 16) as u8;

        Some(Self {
            checksum,
            lvalue: l_capturing(data.len()),
            q1ratio: ratio(q1),
            q2ratio: ratio(q2),
            code,
        })
    }

    /// Render the digest in the canonical `T1` + 70 hex character form.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(72);
        out.push_str("T1");
        out.push_str(&format!("{:02X}", swap_nibbles(self.checksum)));
        out.push_str(&format!("{:02X}", swap_nibbles(self.lvalue)));
        out.push_str(&format!(
            "{:02X}",
            swap_nibbles((self.q1ratio << 4) | self.q2ratio)
        ));
        for byte in self.code.iter().rev() {
            out.push_str(&format!("{byte:02X}"));
        }
        out
    }

    /// Parse a digest back from its hex form.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let body = hex.strip_prefix("T1").unwrap_or(hex);
        if body.len() != 70 || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::invalid_record(format!(
                "not a TLSH digest: '{hex}'"
            )));
        }
        let bytes: Vec<u8> = (0..body.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&body[i..i + 2], 16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::invalid_record(format!("bad TLSH hex: {e}")))?;

        let qb = swap_nibbles(bytes[2]);
        let mut code = [0u8; CODE_SIZE];
        for (i, byte) in bytes[3..].iter().rev().enumerate() {
            code[i] = *byte;
        }
        Ok(Self {
            checksum: swap_nibbles(bytes[0]),
            lvalue: swap_nibbles(bytes[1]),
            q1ratio: qb >> 4,
            q2ratio: qb & 0x0F,
            code,
        })
    }

    /// Distance between two digests (header plus body contribution).
    pub fn diff(&self, other: &Self) -> u32 {
        let mut score = 0u32;
        if self.checksum != other.checksum {
            score += 1;
        }
        score += match mod_diff(self.lvalue, other.lvalue, 256) {
            0 => 0,
            1 => 1,
            d => d * 12,
        };
        for (a, b) in [
            (self.q1ratio, other.q1ratio),
            (self.q2ratio, other.q2ratio),
        ] {
            let d = mod_diff(a, b, 16);
            score += if d <= 1 { d } else { (d - 1) * 12 };
        }
        for (a, b) in self.code.iter().zip(other.code.iter()) {
            let (mut x, mut y) = (*a, *b);
            for _ in 0..4 {
                let d = u32::from((x & 3).abs_diff(y & 3));
                score += if d == 3 { 6 } else { d };
                x >>= 2;
                y >>= 2;
            }
        }
        score
    }
}

/// Hash a byte string, yielding [`TNULL`] when no digest can be formed.
pub fn hash_bytes(data: &[u8]) -> String {
    Digest::compute(data).map_or_else(|| TNULL.to_string(), |d| d.to_hex())
}

/// Hash a payload with the run padding prepended.
pub fn hash_with_padding(padding: &str, payload: &str) -> String {
    let mut data = Vec::with_capacity(padding.len() + payload.len());
    data.extend_from_slice(padding.as_bytes());
    data.extend_from_slice(payload.as_bytes());
    hash_bytes(&data)
}

/// Distance between two digests in hex form.
pub fn diff_hex(a: &str, b: &str) -> Result<u32> {
    Ok(Digest::from_hex(a)?.diff(&Digest::from_hex(b)?))
}

/// The deterministic 200-character padding for a run seed.
pub fn hash_padding(seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    seeded_string(&mut rng, PADDING_LEN)
}

/// A random string over the padding alphabet.
pub fn random_string(len: usize) -> String {
    seeded_string(&mut rand::thread_rng(), len)
}

/// A random digest, used for states that have no interaction data yet.
///
/// Freshly created states carry a throwaway hash so two under-explored
/// states never look identical to the collapser.
pub fn random_state_hash() -> String {
    loop {
        let candidate = hash_bytes(random_string(PADDING_LEN).as_bytes());
        if candidate != TNULL {
            return candidate;
        }
    }
}

fn seeded_string<R: Rng>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(PADDING_CHARSET[rng.gen_range(0..PADDING_CHARSET.len())]))
        .collect()
}

/// Run-scoped hashing context: the seed-derived padding.
#[derive(Debug, Clone)]
pub struct HashContext {
    padding: String,
}

impl HashContext {
    /// Build the context for a run seed.
    pub fn new(seed: u64) -> Self {
        Self {
            padding: hash_padding(seed),
        }
    }

    /// The padding prefix itself (recorded alongside experiment metadata).
    pub fn padding(&self) -> &str {
        &self.padding
    }

    /// Hash a payload under this run's padding.
    pub fn hash(&self, payload: &str) -> String {
        hash_with_padding(&self.padding, payload)
    }
}
