//! # Hash Computation
//!
//! The closed algorithm family, the dictionary mutation engine, and the
//! pure sub-chunk executor functions. Executors take their whole input by
//! value or shared reference and share no mutable state, so they are safe
//! to schedule on independent pool workers.

use blake2::{Blake2b512, Blake2s256};
use hmac::{Hmac, Mac};
use md4::Md4;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512, Sha512_224, Sha512_256};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Sha3_224, Sha3_256, Sha3_384, Sha3_512, Shake128, Shake256};
use std::collections::HashSet;

use crate::hashcrack::keyspace::index_to_combination;
use crate::types::{FabricError, FabricResult};

/// The selectable hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    #[serde(rename = "sha512_224")]
    Sha512_224,
    #[serde(rename = "sha512_256")]
    Sha512_256,
    #[serde(rename = "sha3_224")]
    Sha3_224,
    #[serde(rename = "sha3_256")]
    Sha3_256,
    #[serde(rename = "sha3_384")]
    Sha3_384,
    #[serde(rename = "sha3_512")]
    Sha3_512,
    #[serde(rename = "shake_128")]
    Shake128,
    #[serde(rename = "shake_256")]
    Shake256,
    Blake2b,
    Blake2s,
    Ntlm,
    Ntlmv2,
    Wpa,
}

impl std::str::FromStr for HashAlgo {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let algo = match s {
            "md5" => HashAlgo::Md5,
            "sha1" => HashAlgo::Sha1,
            "sha224" => HashAlgo::Sha224,
            "sha256" => HashAlgo::Sha256,
            "sha384" => HashAlgo::Sha384,
            "sha512" => HashAlgo::Sha512,
            "sha512_224" => HashAlgo::Sha512_224,
            "sha512_256" => HashAlgo::Sha512_256,
            "sha3_224" => HashAlgo::Sha3_224,
            "sha3_256" => HashAlgo::Sha3_256,
            "sha3_384" => HashAlgo::Sha3_384,
            "sha3_512" => HashAlgo::Sha3_512,
            "shake_128" => HashAlgo::Shake128,
            "shake_256" => HashAlgo::Shake256,
            "blake2b" => HashAlgo::Blake2b,
            "blake2s" => HashAlgo::Blake2s,
            "ntlm" => HashAlgo::Ntlm,
            "ntlmv2" => HashAlgo::Ntlmv2,
            "wpa" | "wpa2" => HashAlgo::Wpa,
            other => return Err(FabricError::bad_request(format!("unsupported algorithm: {other}"))),
        };
        Ok(algo)
    }
}

/// Extra parameters some algorithms require.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashParams {
    /// SSID salt for WPA/WPA2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    /// Account name for NTLMv2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Domain for NTLMv2 (may be empty).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Output length in bytes for the SHAKE family.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_length: Option<usize>,
}

fn fixed_digest<D: Digest>(data: &[u8]) -> Vec<u8> {
    D::digest(data).to_vec()
}

fn shake_digest<X: ExtendableOutput + Default>(data: &[u8], output_length: usize) -> Vec<u8> {
    let mut hasher = X::default();
    hasher.update(data);
    let mut reader = hasher.finalize_xof();
    let mut out = vec![0u8; output_length];
    reader.read(&mut out);
    out
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

/// NTLM: MD4 over the password encoded as UTF-16 little-endian.
fn ntlm_digest(candidate: &str) -> Vec<u8> {
    fixed_digest::<Md4>(&utf16le(candidate))
}

/// NTLMv2: HMAC-MD5 keyed by the NTLM digest, over
/// `uppercase(username || domain)` encoded as UTF-16 LE.
fn ntlmv2_digest(candidate: &str, username: &str, domain: &str) -> FabricResult<Vec<u8>> {
    let key = ntlm_digest(candidate);
    let identity = utf16le(&format!("{username}{domain}").to_uppercase());
    let mut mac = Hmac::<Md5>::new_from_slice(&key)
        .map_err(|_| FabricError::internal("hmac key setup"))?;
    Mac::update(&mut mac, &identity);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// WPA/WPA2 PSK: PBKDF2-HMAC-SHA1(passphrase, SSID, 4096 iterations, 32 bytes).
pub fn wpa_psk(passphrase: &str, ssid: &str) -> Vec<u8> {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha1>(passphrase.as_bytes(), ssid.as_bytes(), 4_096, &mut out);
    out.to_vec()
}

/// Compute the digest of one candidate under the selected algorithm.
pub fn compute_digest(candidate: &str, algo: HashAlgo, params: &HashParams) -> FabricResult<Vec<u8>> {
    let data = candidate.as_bytes();
    let digest = match algo {
        HashAlgo::Md5 => fixed_digest::<Md5>(data),
        HashAlgo::Sha1 => fixed_digest::<Sha1>(data),
        HashAlgo::Sha224 => fixed_digest::<Sha224>(data),
        HashAlgo::Sha256 => fixed_digest::<Sha256>(data),
        HashAlgo::Sha384 => fixed_digest::<Sha384>(data),
        HashAlgo::Sha512 => fixed_digest::<Sha512>(data),
        HashAlgo::Sha512_224 => fixed_digest::<Sha512_224>(data),
        HashAlgo::Sha512_256 => fixed_digest::<Sha512_256>(data),
        HashAlgo::Sha3_224 => fixed_digest::<Sha3_224>(data),
        HashAlgo::Sha3_256 => fixed_digest::<Sha3_256>(data),
        HashAlgo::Sha3_384 => fixed_digest::<Sha3_384>(data),
        HashAlgo::Sha3_512 => fixed_digest::<Sha3_512>(data),
        HashAlgo::Shake128 => shake_digest::<Shake128>(data, params.output_length.unwrap_or(32)),
        HashAlgo::Shake256 => shake_digest::<Shake256>(data, params.output_length.unwrap_or(32)),
        HashAlgo::Blake2b => fixed_digest::<Blake2b512>(data),
        HashAlgo::Blake2s => fixed_digest::<Blake2s256>(data),
        HashAlgo::Ntlm => ntlm_digest(candidate),
        HashAlgo::Ntlmv2 => {
            let username = params
                .username
                .as_deref()
                .ok_or_else(|| FabricError::bad_request("ntlmv2 requires username parameter"))?;
            let domain = params.domain.as_deref().unwrap_or("");
            ntlmv2_digest(candidate, username, domain)?
        }
        HashAlgo::Wpa => {
            let ssid = params
                .ssid
                .as_deref()
                .ok_or_else(|| FabricError::bad_request("wpa requires ssid parameter"))?;
            wpa_psk(candidate, ssid)
        }
    };
    Ok(digest)
}

/// Dictionary-mode mutation rules, applied in order, left to right. Each
/// rule maps every current candidate to exactly one output; unknown rules
/// pass the input through unchanged.
pub fn apply_mutations(word: &str, rules: &[String]) -> Vec<String> {
    let mut candidates = vec![word.to_string()];

    for rule in rules {
        let mut next = Vec::with_capacity(candidates.len());
        for w in &candidates {
            let mutated = match rule.as_str() {
                "l" => w.to_lowercase(),
                "u" => w.to_uppercase(),
                "c" => capitalize(w),
                "d" => format!("{w}{w}"),
                "r" => w.chars().rev().collect(),
                _ if rule.starts_with('$') => format!("{w}{}", &rule[1..]),
                _ if rule.starts_with('^') => format!("{}{w}", &rule[1..]),
                _ if rule.starts_with('s') && rule.chars().count() == 3 => {
                    let mut chars = rule.chars().skip(1);
                    let from = chars.next().unwrap();
                    let to = chars.next().unwrap();
                    w.replace(from, &to.to_string())
                }
                _ => w.clone(),
            };
            next.push(mutated);
        }
        candidates = next;
    }

    candidates
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// One discovered preimage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    pub combination: String,
    pub hash: String,
    pub index: u64,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_word: Option<String>,
}

/// Brute-force executor for one sub-chunk of the key space. Pure: every
/// input arrives as an argument, the result is returned.
pub fn compute_brute_subchunk(
    start: u64,
    end: u64,
    charset: &[char],
    length: usize,
    algo: HashAlgo,
    params: &HashParams,
    targets: &HashSet<Vec<u8>>,
) -> FabricResult<(Vec<Solution>, u64)> {
    let mut solutions = Vec::new();
    let mut hash_count = 0u64;

    for idx in start..end {
        let combination = index_to_combination(idx, charset, length);
        let digest = compute_digest(&combination, algo, params)?;

        if targets.contains(&digest) {
            solutions.push(Solution {
                combination,
                hash: hex::encode(&digest),
                index: idx,
                mode: "brute".to_string(),
                base_word: None,
            });
        }
        hash_count += 1;
    }

    Ok((solutions, hash_count))
}

/// Dictionary executor for one sub-chunk of a wordlist. Each word is
/// expanded through the mutation pipeline before hashing.
pub fn compute_dict_subchunk(
    words: &[String],
    mutations: &[String],
    algo: HashAlgo,
    params: &HashParams,
    targets: &HashSet<Vec<u8>>,
    base_index: u64,
) -> FabricResult<(Vec<Solution>, u64)> {
    let mut solutions = Vec::new();
    let mut hash_count = 0u64;

    for (offset, word) in words.iter().enumerate() {
        let candidates = if mutations.is_empty() {
            vec![word.clone()]
        } else {
            apply_mutations(word, mutations)
        };

        for candidate in candidates {
            let digest = compute_digest(&candidate, algo, params)?;
            if targets.contains(&digest) {
                solutions.push(Solution {
                    combination: candidate.clone(),
                    hash: hex::encode(&digest),
                    index: base_index + offset as u64,
                    mode: "dictionary".to_string(),
                    base_word: Some(word.clone()),
                });
            }
            hash_count += 1;
        }
    }

    Ok((solutions, hash_count))
}

/// Decode a set of hex target hashes into raw digest bytes.
pub fn decode_targets(target_hashes: &[String]) -> FabricResult<HashSet<Vec<u8>>> {
    target_hashes
        .iter()
        .map(|h| {
            hex::decode(h.trim())
                .map_err(|_| FabricError::bad_request(format!("target hash is not hex: {h}")))
        })
        .collect()
}
