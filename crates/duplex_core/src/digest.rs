//! Message digests for block audit records, per-stream certification and
//! write verification.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use sha2::Digest;

use crate::error::{CoreError, Result, SinkError};

/// Supported message digest algorithms, named as OpenSSL names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub const ALL: [DigestAlgorithm; 6] = [
        DigestAlgorithm::Md5,
        DigestAlgorithm::Sha1,
        DigestAlgorithm::Sha224,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha384,
        DigestAlgorithm::Sha512,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha224 => "sha224",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 16,
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha224 => 28,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            DigestAlgorithm::Md5 => Hasher::Md5(md5::Md5::new()),
            DigestAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            DigestAlgorithm::Sha224 => Hasher::Sha224(sha2::Sha224::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Sha384 => Hasher::Sha384(sha2::Sha384::new()),
            DigestAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    /// One-shot digest of `bytes`.
    pub fn digest(self, bytes: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(bytes);
        hasher.finalize()
    }

    /// Parses a comma separated list such as `md5,sha256`. Duplicates are
    /// collapsed, order of first appearance is kept.
    pub fn parse_list(list: &str) -> Result<Vec<DigestAlgorithm>> {
        let mut algorithms = Vec::new();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let algorithm: DigestAlgorithm = name.parse()?;
            if !algorithms.contains(&algorithm) {
                algorithms.push(algorithm);
            }
        }
        Ok(algorithms)
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha224" => Ok(DigestAlgorithm::Sha224),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(CoreError::UnknownDigest(s.to_string())),
        }
    }
}

/// Incremental hashing context for one algorithm.
#[derive(Clone)]
pub enum Hasher {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Sha224(sha2::Sha224),
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha224(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha224(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// A finalised whole-stream digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalDigest {
    pub algorithm: DigestAlgorithm,
    #[serde(serialize_with = "serialize_hex")]
    pub bytes: Vec<u8>,
}

impl FinalDigest {
    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

/// Running digests over an entire stream, one context per algorithm.
pub struct StreamDigest {
    contexts: Vec<(DigestAlgorithm, Hasher)>,
}

impl StreamDigest {
    pub fn new(algorithms: &[DigestAlgorithm]) -> Self {
        Self {
            contexts: algorithms.iter().map(|&a| (a, a.hasher())).collect(),
        }
    }

    pub fn disabled() -> Self {
        Self { contexts: Vec::new() }
    }

    pub fn is_enabled(&self) -> bool {
        !self.contexts.is_empty()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for (_, hasher) in &mut self.contexts {
            hasher.update(bytes);
        }
    }

    /// Consumes the contexts. Called once at end of stream.
    pub fn finalize(self) -> Vec<FinalDigest> {
        self.contexts
            .into_iter()
            .map(|(algorithm, hasher)| FinalDigest {
                algorithm,
                bytes: hasher.finalize(),
            })
            .collect()
    }
}

/// Audit record for one `ibs`-sized range of input. `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDigest {
    pub index: u64,
    pub start: u64,
    pub end: u64,
    pub algorithm: DigestAlgorithm,
    #[serde(serialize_with = "serialize_hex")]
    pub digest: Vec<u8>,
}

impl fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block {:>8}: {:016x}-{:016x}: {} - {}",
            self.index,
            self.start,
            self.end,
            self.algorithm,
            hex::encode(&self.digest)
        )
    }
}

/// Digest of an `obs`-sized range of the bytes handed to sinks, used to
/// verify what each sink reads back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckDigest {
    pub start: u64,
    pub end: u64,
    pub algorithm: DigestAlgorithm,
    pub digest: Vec<u8>,
}

/// Splits slots into block ranges and digests them.
#[derive(Debug, Clone)]
pub struct DigestTracker {
    algorithms: Vec<DigestAlgorithm>,
    ibs: usize,
    obs: usize,
}

impl DigestTracker {
    pub fn new(algorithms: Vec<DigestAlgorithm>, ibs: usize, obs: usize) -> Self {
        Self {
            algorithms,
            ibs: ibs.max(1),
            obs: obs.max(1),
        }
    }

    pub fn algorithms(&self) -> &[DigestAlgorithm] {
        &self.algorithms
    }

    /// Per-`ibs` audit records for the pre-transform bytes of a slot whose
    /// first byte sits at `start` and whose first block is `first_index`.
    pub fn digest_blocks(&self, first_index: u64, start: u64, bytes: &[u8]) -> Vec<BlockDigest> {
        let mut records = Vec::with_capacity(bytes.len().div_ceil(self.ibs) * self.algorithms.len());
        for (i, chunk) in bytes.chunks(self.ibs).enumerate() {
            let chunk_start = start + (i * self.ibs) as u64;
            for &algorithm in &self.algorithms {
                records.push(BlockDigest {
                    index: first_index + i as u64,
                    start: chunk_start,
                    end: chunk_start + chunk.len() as u64,
                    algorithm,
                    digest: algorithm.digest(chunk),
                });
            }
        }
        records
    }

    /// Per-`obs` digests of the bytes sinks are about to receive.
    pub fn check_digests(&self, start: u64, bytes: &[u8]) -> Vec<CheckDigest> {
        let mut checks = Vec::with_capacity(bytes.len().div_ceil(self.obs) * self.algorithms.len());
        for (i, chunk) in bytes.chunks(self.obs).enumerate() {
            let chunk_start = start + (i * self.obs) as u64;
            for &algorithm in &self.algorithms {
                checks.push(CheckDigest {
                    start: chunk_start,
                    end: chunk_start + chunk.len() as u64,
                    algorithm,
                    digest: algorithm.digest(chunk),
                });
            }
        }
        checks
    }

    /// Compares bytes read back from a sink against the digests captured when
    /// the slot was filled. `start` is the stream offset of `reread[0]`.
    pub fn verify(
        &self,
        expected: &[CheckDigest],
        start: u64,
        reread: &[u8],
    ) -> std::result::Result<(), SinkError> {
        for check in expected {
            let lo = (check.start - start) as usize;
            let hi = (check.end - start) as usize;
            let Some(range) = reread.get(lo..hi) else {
                return Err(SinkError::ShortReread {
                    expected: hi,
                    actual: reread.len(),
                });
            };
            let actual = check.algorithm.digest(range);
            if actual != check.digest {
                return Err(SinkError::VerificationFailed {
                    start: check.start,
                    end: check.end,
                    algorithm: check.algorithm,
                    expected: hex::encode(&check.digest),
                    actual: hex::encode(actual),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_empty_digests() {
        assert_eq!(
            hex::encode(DigestAlgorithm::Md5.digest(b"")),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            hex::encode(DigestAlgorithm::Sha1.digest(b"")),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert_eq!(
            hex::encode(DigestAlgorithm::Sha256.digest(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_output_len_matches_digest() {
        for algorithm in DigestAlgorithm::ALL {
            assert_eq!(algorithm.digest(b"duplex").len(), algorithm.output_len());
        }
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("MD5".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Md5);
        assert_eq!(
            DigestAlgorithm::parse_list("sha256, md5,sha256").unwrap(),
            vec![DigestAlgorithm::Sha256, DigestAlgorithm::Md5]
        );
        assert!(matches!(
            "crc32".parse::<DigestAlgorithm>(),
            Err(CoreError::UnknownDigest(name)) if name == "crc32"
        ));
    }

    #[test]
    fn test_stream_digest_is_incremental() {
        let mut stream = StreamDigest::new(&[DigestAlgorithm::Md5, DigestAlgorithm::Sha512]);
        stream.update(b"hello ");
        stream.update(b"world");
        let digests = stream.finalize();

        assert_eq!(digests.len(), 2);
        assert_eq!(digests[0].bytes, DigestAlgorithm::Md5.digest(b"hello world"));
        assert_eq!(digests[1].bytes, DigestAlgorithm::Sha512.digest(b"hello world"));
    }

    #[test]
    fn test_block_digest_wire_format() {
        let tracker = DigestTracker::new(vec![DigestAlgorithm::Md5], 512, 512);
        let data = vec![0u8; 1024 + 100];
        let records = tracker.digest_blocks(7, 4096, &data);

        assert_eq!(records.len(), 3);
        assert_eq!(records[2].index, 9);
        assert_eq!(records[2].start, 4096 + 1024);
        assert_eq!(records[2].end, 4096 + 1124);
        assert_eq!(
            records[0].to_string(),
            "block        7: 0000000000001000-0000000000001200: md5 - bf619eac0cdf3f68d496ea9344137e8b"
        );
    }

    #[test]
    fn test_verify_reports_offending_range() {
        let tracker = DigestTracker::new(vec![DigestAlgorithm::Sha1], 1024, 512);
        let data: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
        let checks = tracker.check_digests(8192, &data);
        assert_eq!(checks.len(), 4);

        assert!(tracker.verify(&checks, 8192, &data).is_ok());

        let mut corrupted = data.clone();
        corrupted[1500] ^= 0xFF;
        match tracker.verify(&checks, 8192, &corrupted) {
            Err(SinkError::VerificationFailed { start, end, algorithm, .. }) => {
                assert_eq!(start, 8192 + 1024);
                assert_eq!(end, 8192 + 1536);
                assert_eq!(algorithm, DigestAlgorithm::Sha1);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert!(matches!(
            tracker.verify(&checks, 8192, &data[..1000]),
            Err(SinkError::ShortReread { .. })
        ));
    }
}
