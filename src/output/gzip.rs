//! Incremental gzip stream
//!
//! Pull-based gzip encoder over an arbitrary byte source. The gzip header
//! is emitted at construction; each `read(n)` drains already-compressed
//! bytes first and only pulls more input — in fixed 24 KiB chunks — when
//! the buffer cannot satisfy the request. On source exhaustion the
//! deflate stream is finished and the fixed trailer (CRC-32 of the
//! uncompressed bytes, uncompressed length mod 2^32) is appended. Memory
//! stays bounded by the undrained tail regardless of total output size.

use std::collections::VecDeque;
use std::io::{self, Read};

use chrono::Utc;
use flate2::{Compress, Compression, Crc, FlushCompress, Status};

/// Input is pulled from the source in chunks of this size
pub const CHUNK_SIZE: usize = 24 * 1024;

/// gzip magic plus "deflate" compression method
const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

/// FLG bit announcing an original-filename field
const FLAG_FNAME: u8 = 0x08;

/// OS byte: unknown
const OS_UNKNOWN: u8 = 0xff;

/// Pull-based incremental gzip encoder
///
/// One instance serves exactly one download; it is never shared.
pub struct GzipStream<R: Read> {
    source: R,
    compress: Compress,
    crc: Crc,
    buf: VecDeque<u8>,
    chunk: Vec<u8>,
    exhausted: bool,
}

impl<R: Read> GzipStream<R> {
    /// Wrap `source`, emitting the gzip header (with `filename` as the
    /// original-name field when given) into the output buffer.
    pub fn new(source: R, filename: Option<&str>) -> Self {
        let mut buf = VecDeque::new();
        buf.extend(GZIP_MAGIC);
        buf.push_back(if filename.is_some() { FLAG_FNAME } else { 0 });
        let mtime = Utc::now().timestamp().max(0) as u32;
        buf.extend(mtime.to_le_bytes());
        buf.push_back(0); // XFL
        buf.push_back(OS_UNKNOWN);
        if let Some(name) = filename {
            buf.extend(name.as_bytes().iter().filter(|&&b| b != 0));
            buf.push_back(0);
        }

        Self {
            source,
            compress: Compress::new(Compression::default(), false),
            crc: Crc::new(),
            buf,
            chunk: vec![0u8; CHUNK_SIZE],
            exhausted: false,
        }
    }

    /// Whether the source is fully consumed and the trailer written;
    /// subsequent reads only drain the remaining buffer
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Produce up to `n` compressed bytes; an empty result means the
    /// stream is done.
    pub fn read_chunk(&mut self, n: usize) -> io::Result<Vec<u8>> {
        while self.buf.len() < n && !self.exhausted {
            self.pull()?;
        }
        let take = n.min(self.buf.len());
        Ok(self.buf.drain(..take).collect())
    }

    /// Pull one chunk from the source into the compressor, or finish the
    /// stream on EOF.
    fn pull(&mut self) -> io::Result<()> {
        let read = self.source.read(&mut self.chunk)?;
        if read == 0 {
            self.finish()?;
            return Ok(());
        }
        self.crc.update(&self.chunk[..read]);

        let mut consumed = 0;
        while consumed < read {
            let mut out = Vec::with_capacity(CHUNK_SIZE);
            let before = self.compress.total_in();
            self.compress
                .compress_vec(&self.chunk[consumed..read], &mut out, FlushCompress::None)
                .map_err(io::Error::other)?;
            consumed += (self.compress.total_in() - before) as usize;
            self.buf.extend(out);
        }
        Ok(())
    }

    /// Flush the deflate stream and append the gzip trailer
    fn finish(&mut self) -> io::Result<()> {
        loop {
            let mut out = Vec::with_capacity(CHUNK_SIZE);
            let status = self
                .compress
                .compress_vec(&[], &mut out, FlushCompress::Finish)
                .map_err(io::Error::other)?;
            self.buf.extend(out);
            if status == Status::StreamEnd {
                break;
            }
        }
        self.buf.extend(self.crc.sum().to_le_bytes());
        self.buf.extend(self.crc.amount().to_le_bytes());
        self.exhausted = true;
        Ok(())
    }
}

impl<R: Read> Read for GzipStream<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let bytes = self.read_chunk(out.len())?;
        out[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Cursor;

    fn gzip_all(input: &[u8], filename: Option<&str>, page: usize) -> Vec<u8> {
        let mut stream = GzipStream::new(Cursor::new(input.to_vec()), filename);
        let mut out = Vec::new();
        loop {
            let chunk = stream.read_chunk(page).unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend(chunk);
        }
        out
    }

    fn gunzip(compressed: &[u8]) -> Vec<u8> {
        let mut decoder = GzDecoder::new(compressed);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_round_trip_reproduces_the_exact_input() {
        let input: Vec<u8> = (0..200_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let compressed = gzip_all(&input, None, 4096);
        assert_eq!(gunzip(&compressed), input);
    }

    #[test]
    fn test_empty_source_still_produces_a_valid_stream() {
        let compressed = gzip_all(b"", None, 512);
        assert_eq!(gunzip(&compressed), b"");
    }

    #[test]
    fn test_trailer_carries_crc_and_length_of_the_uncompressed_stream() {
        let input = b"hello gzip trailer".to_vec();
        let compressed = gzip_all(&input, None, 64);

        let trailer = &compressed[compressed.len() - 8..];
        let crc = u32::from_le_bytes(trailer[..4].try_into().unwrap());
        let isize = u32::from_le_bytes(trailer[4..].try_into().unwrap());

        let mut expected = Crc::new();
        expected.update(&input);
        assert_eq!(crc, expected.sum());
        assert_eq!(isize, input.len() as u32);
    }

    #[test]
    fn test_header_embeds_the_filename_once() {
        let compressed = gzip_all(b"payload", Some("output-42"), 16);
        assert_eq!(&compressed[..3], &GZIP_MAGIC);
        assert_eq!(compressed[3], FLAG_FNAME);
        let name_start = 10;
        let nul = name_start
            + compressed[name_start..]
                .iter()
                .position(|&b| b == 0)
                .unwrap();
        assert_eq!(&compressed[name_start..nul], b"output-42");
        assert_eq!(gunzip(&compressed), b"payload");
    }

    #[test]
    fn test_tiny_reads_drain_before_pulling_more_input() {
        let input = vec![7u8; 100 * 1024];
        // A 1-byte page forces many drain-only reads between pulls.
        let compressed = gzip_all(&input, None, 1);
        assert_eq!(gunzip(&compressed), input);
    }

    #[test]
    fn test_exhausted_stream_reads_empty_forever() {
        let mut stream = GzipStream::new(Cursor::new(b"x".to_vec()), None);
        let mut all = Vec::new();
        loop {
            let chunk = stream.read_chunk(256).unwrap();
            if chunk.is_empty() {
                break;
            }
            all.extend(chunk);
        }
        assert!(stream.is_exhausted());
        assert!(stream.read_chunk(256).unwrap().is_empty());
        assert_eq!(gunzip(&all), b"x");
    }
}
