//! The rapid streamer client.
//!
//! One POST to `<repo>/streamer.cgi?<sdp_md5>` carries a gzipped bitset of
//! wanted files (bit `j` of the package's file list lives at
//! `byte[j/8] & (1 << (j%8))`). The response is a bare concatenation of
//! `length: u32-be, <length bytes of gzipped pool object>` frames, in
//! package order restricted to the requested files. The length is the
//! *compressed* size; the uncompressed size from the descriptor does not
//! appear on the wire.
//!
//! Network chunk boundaries are arbitrary, so [`PoolStreamWriter`] is a
//! byte-driven state machine: a frame length can arrive split across chunks,
//! and one chunk can span several small files.

use std::io::Write;
use std::path::PathBuf;

use flate2::write::GzEncoder;
use flate2::Compression;
use prd_fetch::{DownloadError, Result, Session};
use prd_fs::{SpringDir, StagedFile};
use prd_hash::Md5Digest;
use tracing::{debug, info};

use crate::sdp::{FileEntry, Sdp};

/// Gzipped request bitset selecting the `fetch`-marked entries.
pub fn build_request_bitmap(files: &[FileEntry]) -> Result<Vec<u8>> {
    let mut bits = vec![0u8; files.len() / 8 + 1];
    for (i, entry) in files.iter().enumerate() {
        if entry.fetch {
            bits[i / 8] |= 1 << (i % 8);
        }
    }
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&bits)
        .and_then(|_| enc.finish())
        .map_err(|e| DownloadError::Parse(format!("compressing request bitmap: {e}")))
}

enum StreamState {
    /// Accumulating the 4-byte frame length; `have` bytes so far.
    NeedLength { have: usize },
    /// Writing the current frame; `remaining` compressed bytes to go.
    Writing { remaining: u32 },
}

/// Demultiplexes a streamer response into verified pool objects.
pub struct PoolStreamWriter<'a> {
    dir: &'a SpringDir,
    files: &'a [FileEntry],
    /// Scan position in `files`; only `fetch`-marked entries receive frames.
    next: usize,
    len_buf: [u8; 4],
    state: StreamState,
    current: Option<OpenFile>,
}

struct OpenFile {
    staged: StagedFile,
    final_path: PathBuf,
    expected: Md5Digest,
}

impl<'a> PoolStreamWriter<'a> {
    pub fn new(dir: &'a SpringDir, files: &'a [FileEntry]) -> PoolStreamWriter<'a> {
        PoolStreamWriter {
            dir,
            files,
            next: 0,
            len_buf: [0; 4],
            state: StreamState::NeedLength { have: 0 },
            current: None,
        }
    }

    /// Consume one network chunk.
    pub fn feed(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.state {
                StreamState::NeedLength { have } => {
                    let take = buf.len().min(4 - have);
                    self.len_buf[have..have + take].copy_from_slice(&buf[..take]);
                    buf = &buf[take..];
                    let have = have + take;
                    if have < 4 {
                        self.state = StreamState::NeedLength { have };
                        return Ok(());
                    }
                    let length = u32::from_be_bytes(self.len_buf);
                    self.open_next(length)?;
                    self.state = StreamState::Writing { remaining: length };
                }
                StreamState::Writing { remaining } => {
                    let take = buf.len().min(remaining as usize);
                    let current = self
                        .current
                        .as_mut()
                        .expect("writing state implies an open file");
                    current.staged.write(&buf[..take])?;
                    buf = &buf[take..];
                    let remaining = remaining - take as u32;
                    if remaining == 0 {
                        self.close_current()?;
                        self.state = StreamState::NeedLength { have: 0 };
                    } else {
                        self.state = StreamState::Writing { remaining };
                    }
                }
            }
        }
        Ok(())
    }

    /// End of response: every requested file must have arrived whole.
    pub fn finish(mut self) -> Result<()> {
        if self.current.is_some() || matches!(self.state, StreamState::NeedLength { have } if have > 0)
        {
            return Err(DownloadError::PoolCorrupt(
                "stream ended inside a frame".into(),
            ));
        }
        if let Some(entry) = self.files[self.next..].iter().find(|f| f.fetch) {
            return Err(DownloadError::PoolCorrupt(format!(
                "stream ended before '{}' was delivered",
                entry.name
            )));
        }
        Ok(())
    }

    fn open_next(&mut self, compressed_len: u32) -> Result<()> {
        let entry = loop {
            match self.files.get(self.next) {
                Some(entry) if entry.fetch => break entry,
                Some(_) => self.next += 1,
                None => {
                    return Err(DownloadError::PoolCorrupt(
                        "more frames than requested files".into(),
                    ))
                }
            }
        };
        if compressed_len == 0 {
            return Err(DownloadError::PoolCorrupt(format!(
                "zero-length frame for '{}'",
                entry.name
            )));
        }
        let final_path = self.dir.pool_path(&entry.md5.to_hex());
        debug!(
            file = %entry.name,
            compressed_len,
            pool = %final_path.display(),
            "receiving pool object"
        );
        self.current = Some(OpenFile {
            staged: StagedFile::open(&final_path)?,
            final_path,
            expected: entry.md5,
        });
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        let current = self.current.take().expect("closing without an open file");
        current.staged.commit()?;
        if !prd_fs::pool_file_valid(&current.final_path, &current.expected) {
            let _ = std::fs::remove_file(&current.final_path);
            return Err(DownloadError::PoolCorrupt(format!(
                "{} failed hash validation",
                current.final_path.display()
            )));
        }
        self.next += 1;
        Ok(())
    }
}

/// Fetch the `fetch`-marked files of one package through the streamer.
pub async fn download_stream(
    session: &Session,
    dir: &SpringDir,
    sdp: &Sdp,
    files: &[FileEntry],
) -> Result<()> {
    let url = sdp.streamer_url();
    info!(tag = %sdp.shortname, %url, "downloading via streamer");
    let body = build_request_bitmap(files)?;

    let resp = session
        .client(true)
        .post(&url)
        .body(body)
        .send()
        .await
        .map_err(|e| DownloadError::from_transport(&e))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(DownloadError::HttpStatus(status.as_u16()));
    }
    let total = resp.content_length().unwrap_or(0);

    let mut writer = PoolStreamWriter::new(dir, files);
    let mut resp = resp;
    let mut done = 0u64;
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| DownloadError::from_transport(&e))?
    {
        if session.abort_requested() {
            return Err(DownloadError::Aborted);
        }
        writer.feed(&chunk)?;
        done += chunk.len() as u64;
        if total > 0 {
            session.observer().progress(done, total);
        }
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use prd_hash::md5_of;
    use std::io::Read;

    fn entry(payload: &[u8], fetch: bool) -> FileEntry {
        FileEntry {
            name: format!("file-{}", md5_of(payload).to_hex()),
            md5: md5_of(payload),
            crc32: [0; 4],
            size: payload.len() as u32,
            fetch,
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn frame(compressed: &[u8]) -> Vec<u8> {
        let mut out = (compressed.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(compressed);
        out
    }

    #[test]
    fn bitmap_sets_bits_for_requested_files() {
        let files: Vec<FileEntry> = (0..10)
            .map(|i| entry(format!("f{i}").as_bytes(), i % 3 == 0))
            .collect();
        let compressed = build_request_bitmap(&files).unwrap();
        let mut bits = Vec::new();
        GzDecoder::new(&compressed[..])
            .read_to_end(&mut bits)
            .unwrap();
        assert_eq!(bits.len(), 10 / 8 + 1);
        // files 0, 3, 6, 9
        assert_eq!(bits[0], 0b0100_1001);
        assert_eq!(bits[1], 0b0000_0010);
    }

    #[test]
    fn demultiplexes_across_arbitrary_chunking() {
        let dir = tempfile::tempdir().unwrap();
        let spring = SpringDir::new(dir.path());

        let payload_a = b"first pool file".to_vec();
        let payload_b = b"second, slightly longer pool file".to_vec();
        let files = vec![entry(&payload_a, true), entry(&payload_b, true)];

        let mut wire = Vec::new();
        wire.extend(frame(&gzip(&payload_a)));
        wire.extend(frame(&gzip(&payload_b)));

        // feed in chunks that split the length prefix and span frames
        for chunk_len in [1usize, 2, 3, 7, 16, 1024] {
            let mut writer = PoolStreamWriter::new(&spring, &files);
            for chunk in wire.chunks(chunk_len) {
                writer.feed(chunk).unwrap();
            }
            writer.finish().unwrap();

            for (payload, file) in [(&payload_a, &files[0]), (&payload_b, &files[1])] {
                let path = spring.pool_path(&file.md5.to_hex());
                assert!(path.exists());
                assert!(prd_fs::pool_file_valid(&path, &md5_of(payload)));
                std::fs::remove_file(&path).unwrap();
            }
        }
    }

    #[test]
    fn skips_files_not_requested() {
        let dir = tempfile::tempdir().unwrap();
        let spring = SpringDir::new(dir.path());

        let wanted = b"the one we asked for".to_vec();
        let files = vec![
            entry(b"already in pool", false),
            entry(&wanted, true),
            entry(b"also present", false),
        ];

        let mut writer = PoolStreamWriter::new(&spring, &files);
        writer.feed(&frame(&gzip(&wanted))).unwrap();
        writer.finish().unwrap();

        assert!(spring.pool_path(&files[1].md5.to_hex()).exists());
        assert!(!spring.pool_path(&files[0].md5.to_hex()).exists());
    }

    #[test]
    fn corrupt_frame_is_deleted_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let spring = SpringDir::new(dir.path());

        let payload = b"expected contents".to_vec();
        let files = vec![entry(&payload, true)];

        // valid gzip, wrong contents
        let mut writer = PoolStreamWriter::new(&spring, &files);
        let err = writer
            .feed(&frame(&gzip(b"tampered contents")))
            .unwrap_err();
        assert!(matches!(err, DownloadError::PoolCorrupt(_)), "got {err}");
        assert!(!spring.pool_path(&files[0].md5.to_hex()).exists());
    }

    #[test]
    fn truncated_stream_fails_finish() {
        let dir = tempfile::tempdir().unwrap();
        let spring = SpringDir::new(dir.path());

        let payload = b"whole file".to_vec();
        let files = vec![entry(&payload, true)];
        let wire = frame(&gzip(&payload));

        // stream cut inside the frame body
        let mut writer = PoolStreamWriter::new(&spring, &files);
        writer.feed(&wire[..wire.len() - 4]).unwrap();
        assert!(writer.finish().is_err());

        // stream cut inside the length prefix
        let mut writer = PoolStreamWriter::new(&spring, &files);
        writer.feed(&wire[..2]).unwrap();
        assert!(writer.finish().is_err());

        // nothing delivered at all
        let writer = PoolStreamWriter::new(&spring, &files);
        assert!(writer.finish().is_err());
    }

    #[test]
    fn excess_frames_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spring = SpringDir::new(dir.path());

        let payload = b"single file".to_vec();
        let files = vec![entry(&payload, true)];

        let mut wire = frame(&gzip(&payload));
        wire.extend(frame(&gzip(b"unexpected extra")));

        let mut writer = PoolStreamWriter::new(&spring, &files);
        let err = writer.feed(&wire).unwrap_err();
        assert!(matches!(err, DownloadError::PoolCorrupt(_)), "got {err}");
    }
}
