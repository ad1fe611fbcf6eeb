//! Streaming hashes for download verification.
//!
//! Two hashers are provided:
//! - [`Md5Hash`] - plain incremental MD5 over the bytes fed in
//! - [`GzipHash`] - inflates the bytes fed in and hashes the *decompressed*
//!   stream with an inner hasher, so gzipped pool objects can be verified
//!   without ever writing the decompressed form to disk
//!
//! Both implement [`StreamHash`], which is what the transfer engine drives
//! chunk by chunk while a download is in flight.

use std::fmt;

use digest::Digest;
use flate2::{Decompress, FlushDecompress, Status};
use md5::Md5;

/// A finalized 128-bit MD5 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Md5Digest(pub [u8; 16]);

impl Md5Digest {
    /// Digest returned by [`GzipHash`] when the compressed stream was
    /// corrupt or truncated. Compares unequal to any real MD5.
    pub const INVALID: Md5Digest = Md5Digest([0xff; 16]);

    /// Parse a 32-character hex string.
    pub fn from_hex(s: &str) -> Option<Md5Digest> {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Md5Digest(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for Md5Digest {
    fn from(raw: [u8; 16]) -> Self {
        Md5Digest(raw)
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Md5Digest({})", self.to_hex())
    }
}

/// One-shot MD5 of a byte slice.
pub fn md5_of(data: &[u8]) -> Md5Digest {
    Md5Digest(Md5::digest(data).into())
}

/// Incremental hash fed by the transfer engine while bytes stream in.
///
/// `finish` latches: the first call computes the digest, later calls return
/// the same value. Implementations must be `Send` because hashing happens on
/// the I/O worker threads.
pub trait StreamHash: Send {
    fn update(&mut self, data: &[u8]);
    fn finish(&mut self) -> Md5Digest;
}

/// Plain incremental MD5.
pub struct Md5Hash {
    ctx: Option<Md5>,
    digest: Option<Md5Digest>,
}

impl Md5Hash {
    pub fn new() -> Self {
        Md5Hash {
            ctx: Some(Md5::new()),
            digest: None,
        }
    }
}

impl Default for Md5Hash {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHash for Md5Hash {
    fn update(&mut self, data: &[u8]) {
        if let Some(ctx) = &mut self.ctx {
            ctx.update(data);
        }
    }

    fn finish(&mut self) -> Md5Digest {
        if let Some(ctx) = self.ctx.take() {
            self.digest = Some(Md5Digest(ctx.finalize().into()));
        }
        self.digest.unwrap_or(Md5Digest::INVALID)
    }
}

/// Hashes the decompressed form of a gzip stream with an inner hasher.
///
/// Any inflate error (bad header, corrupt data) latches the hasher into an
/// error state: further updates are no-ops and `finish` returns
/// [`Md5Digest::INVALID`]. Reaching `finish` without having seen the gzip
/// end-of-stream marker is also an error, so a truncated download can never
/// produce a matching digest.
pub struct GzipHash<H: StreamHash> {
    inner: H,
    inflate: Decompress,
    error: bool,
    stream_done: bool,
    digest: Option<Md5Digest>,
}

/// Gzip-wrapped MD5, the verifier for rapid pool objects.
pub type GzipMd5 = GzipHash<Md5Hash>;

impl GzipMd5 {
    pub fn new() -> Self {
        GzipHash::with_inner(Md5Hash::new())
    }
}

impl Default for GzipMd5 {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: StreamHash> GzipHash<H> {
    pub fn with_inner(inner: H) -> Self {
        GzipHash {
            inner,
            inflate: Decompress::new_gzip(15),
            error: false,
            stream_done: false,
            digest: None,
        }
    }
}

impl<H: StreamHash> StreamHash for GzipHash<H> {
    fn update(&mut self, data: &[u8]) {
        if self.error || self.stream_done {
            // Trailing garbage after the gzip stream is ignored, errors latch.
            return;
        }
        let mut remaining = data;
        let mut out = [0u8; 32 * 1024];
        while !remaining.is_empty() && !self.stream_done {
            let in_before = self.inflate.total_in();
            let out_before = self.inflate.total_out();
            match self
                .inflate
                .decompress(remaining, &mut out, FlushDecompress::None)
            {
                Ok(status) => {
                    let consumed = (self.inflate.total_in() - in_before) as usize;
                    let produced = (self.inflate.total_out() - out_before) as usize;
                    self.inner.update(&out[..produced]);
                    remaining = &remaining[consumed..];
                    match status {
                        Status::StreamEnd => self.stream_done = true,
                        Status::BufError if consumed == 0 && produced == 0 => {
                            // Inflate wants more input than we have buffered.
                            return;
                        }
                        _ => {}
                    }
                }
                Err(_) => {
                    self.error = true;
                    return;
                }
            }
        }
    }

    fn finish(&mut self) -> Md5Digest {
        if let Some(digest) = self.digest {
            return digest;
        }
        if !self.stream_done {
            self.error = true;
        }
        let digest = if self.error {
            Md5Digest::INVALID
        } else {
            self.inner.finish()
        };
        self.digest = Some(digest);
        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn md5_known_value() {
        assert_eq!(
            md5_of(b"hello world").to_hex(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn md5_incremental_matches_oneshot() {
        let mut h = Md5Hash::new();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.finish(), md5_of(b"hello world"));
        // finish latches
        assert_eq!(h.finish(), md5_of(b"hello world"));
    }

    #[test]
    fn digest_hex_round_trip() {
        let d = md5_of(b"abc");
        assert_eq!(Md5Digest::from_hex(&d.to_hex()), Some(d));
        assert_eq!(Md5Digest::from_hex("zz"), None);
        assert_eq!(Md5Digest::from_hex(""), None);
    }

    #[test]
    fn gzip_hash_whole_stream() {
        let payload = b"the quick brown fox jumps over the lazy dog";
        let compressed = gzip(payload);
        let mut h = GzipMd5::new();
        h.update(&compressed);
        assert_eq!(h.finish(), md5_of(payload));
    }

    #[test]
    fn gzip_hash_byte_at_a_time() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = gzip(&payload);
        let mut h = GzipMd5::new();
        for b in &compressed {
            h.update(std::slice::from_ref(b));
        }
        assert_eq!(h.finish(), md5_of(&payload));
    }

    #[test]
    fn gzip_hash_corrupt_stream_is_invalid() {
        let mut compressed = gzip(b"some pool file");
        let mid = compressed.len() / 2;
        compressed[mid] ^= 0xff;
        let mut h = GzipMd5::new();
        h.update(&compressed);
        assert_eq!(h.finish(), Md5Digest::INVALID);
    }

    #[test]
    fn gzip_hash_truncated_stream_is_invalid() {
        let compressed = gzip(b"some pool file");
        let mut h = GzipMd5::new();
        h.update(&compressed[..compressed.len() - 3]);
        assert_eq!(h.finish(), Md5Digest::INVALID);
    }

    #[test]
    fn gzip_hash_garbage_is_invalid() {
        let mut h = GzipMd5::new();
        h.update(b"this is definitely not a gzip stream");
        assert_eq!(h.finish(), Md5Digest::INVALID);
        // latched: more input doesn't revive it
        h.update(&gzip(b"x"));
        assert_eq!(h.finish(), Md5Digest::INVALID);
    }

    #[test]
    fn gzip_hash_empty_payload() {
        let compressed = gzip(b"");
        let mut h = GzipMd5::new();
        h.update(&compressed);
        assert_eq!(h.finish(), md5_of(b""));
    }
}
