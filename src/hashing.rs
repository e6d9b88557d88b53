//! Fingerprints: the strong, content-derived hash that identifies a [`Blob`](crate::catalog::model::Blob).

use std::fmt;
use std::fs;
use std::io;
use std::io::prelude::*;

use anyhow::{Context, Result, ensure};
use camino::Utf8Path;
use sha2::{Digest, Sha256, digest::Output};

type Sha256Digest = Output<Sha256>;

/// A strong cryptographic digest of a blob's raw (pre-compression) bytes.
///
/// Hex-encoded everywhere it's displayed, stored, or parsed, matching the
/// fingerprint format the catalog and blob store paths are built from.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Fingerprint {
    digest: Sha256Digest,
}

impl Fingerprint {
    /// Hashes the given bytes in one shot.
    pub fn hash(bytes: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(bytes),
        }
    }

    fn from_digest(digest: Sha256Digest) -> Self {
        Self { digest }
    }

    /// The first byte of the digest, hex-encoded (two characters) — the
    /// blob store's fan-out subdirectory name for this fingerprint.
    pub fn fanout_dir(&self) -> String {
        hex::encode(&self.digest[..1])
    }

    /// A short, git-like prefix suitable for log messages.
    pub fn short_name(&self) -> String {
        let full = self.to_string();
        full[..8].to_string()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.digest))
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).with_context(|| format!("Couldn't decode {s} as hex"))?;
        ensure!(
            bytes.len() == <Sha256 as Digest>::output_size(),
            "Expected a SHA256 fingerprint ({} hex chars)",
            <Sha256 as Digest>::output_size() * 2
        );
        Ok(Fingerprint::from_digest(*Sha256Digest::from_slice(&bytes)))
    }
}

impl serde::Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Fingerprint, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Wraps a reader, accumulating a fingerprint over every byte read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> (Fingerprint, R) {
        (Fingerprint::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

/// Wraps a writer, accumulating a fingerprint over every byte written
/// through it. Used by the compressor so raw-content hashing and
/// compressed-writing happen in the same streaming pass.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    len: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            len: 0,
        }
    }

    /// Bytes written so far (the raw, pre-compression length).
    pub fn bytes_written(&self) -> u64 {
        self.len
    }

    pub fn finalize(self) -> (Fingerprint, u64, W) {
        (
            Fingerprint::from_digest(self.hasher.finalize()),
            self.len,
            self.inner,
        )
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        self.len += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hashes a whole file in one streaming pass, used wherever a fingerprint
/// must be (re)computed from bytes already on disk: the Hash Pre-Pass, and
/// the `copy_hash`/`default`-cow write paths that hash a just-copied file.
pub fn hash_file(path: &Utf8Path) -> Result<Fingerprint> {
    let fh = fs::File::open(path).with_context(|| format!("Couldn't open {path}"))?;
    let mut reader = HashingReader::new(io::BufReader::new(fh));
    io::copy(&mut reader, &mut io::sink()).with_context(|| format!("Couldn't hash {path}"))?;
    Ok(reader.finalize().0)
}

/// A fast, non-cryptographic-strength tag derived from a path, used only to
/// give temp filenames a short, collision-resistant-enough unique component.
/// Not used for blob identity.
pub fn path_uniqueness_tag(posix_path: &str) -> String {
    use md5::Digest;
    let digest = md5::Md5::digest(posix_path.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod test {
    use super::*;

    const DEVELOPERS: &[u8] = b"Developers, developers, developers, developers!".as_slice();

    // sha256sum of DEVELOPERS
    const EXPECTED: &str = "2cca07b57ec9bb130e3f1f6f1d7e5c3eb468a0fe1c4c4a7a9f0a331f51258069";

    #[test]
    fn hello_scenario() {
        // Scenario 1 in SPEC_FULL.md: SHA256("hi\n")
        let id = Fingerprint::hash(b"hi\n");
        assert_eq!(
            id.to_string(),
            "98ea6e4f216f2fb4b69fff9b3a44842c38686ca685f3f55dc48c5d3fb1107be4"
        );
    }

    #[test]
    fn round_trip() -> Result<()> {
        let id = Fingerprint::hash(DEVELOPERS);
        let parsed: Fingerprint = id.to_string().parse()?;
        assert_eq!(id, parsed);
        Ok(())
    }

    #[test]
    fn reader() -> Result<()> {
        let mut r = HashingReader::new(DEVELOPERS);
        io::copy(&mut r, &mut io::sink())?;
        assert_eq!(r.finalize().0.to_string(), EXPECTED);
        Ok(())
    }

    #[test]
    fn writer() -> Result<()> {
        let mut w = HashingWriter::new(io::sink());
        w.write_all(DEVELOPERS)?;
        let (id, len, _) = w.finalize();
        assert_eq!(id.to_string(), EXPECTED);
        assert_eq!(len, DEVELOPERS.len() as u64);
        Ok(())
    }
}
