//! Output gateway
//!
//! Serves job stdout two ways: a paginated line read for tailing, and a
//! download of either the raw/gzip output file (streamed incrementally)
//! or a gzip tar bundle of every artifact in the job's spool directory
//! (built fully in memory, returned as one attachment).

mod gzip;

pub use gzip::{GzipStream, CHUNK_SIZE};

use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::ledger::{JobId, Ledger};
use crate::scheduler::OUTPUT_FILE;

/// What a download contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadContent {
    /// Just the stdout artifact
    Output,
    /// Every artifact in the job's spool directory, as one tar bundle
    All,
}

/// How the output download is encoded; bundles are always gzip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEncoding {
    /// Bytes as they are on disk
    Raw,
    /// Incrementally gzip-compressed
    Gzip,
}

/// Body of a download
pub enum DownloadBody {
    /// Streamed incrementally; pull from the reader
    Stream(Box<dyn Read + Send>),
    /// Fully materialized in memory
    Bytes(Vec<u8>),
}

/// A retrievable attachment
pub struct Download {
    /// Suggested attachment filename
    pub filename: String,
    /// Whether the body carries the gzip compression marker
    pub compressed: bool,
    /// The payload
    pub body: DownloadBody,
}

/// Read access to job artifacts
pub struct OutputGateway {
    ledger: Arc<dyn Ledger>,
    spool: PathBuf,
}

impl OutputGateway {
    /// Create a gateway over the spool directory the scheduler writes to
    pub fn new(ledger: Arc<dyn Ledger>, spool: PathBuf) -> Self {
        Self { ledger, spool }
    }

    fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.spool.join(job_id.to_string())
    }

    /// Verify the job exists; NotFound otherwise
    fn check_job(&self, job_id: JobId) -> Result<()> {
        match self.ledger.get_job(job_id)? {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("job {job_id}"))),
        }
    }

    /// Return `qty` output lines starting at 0-based `offset`; `qty = -1`
    /// means all remaining. Returns fewer lines if that is all that
    /// exists and an empty string when the artifact does not exist yet —
    /// never blocks or pads.
    pub fn read_output(&self, job_id: JobId, offset: usize, qty: i64) -> Result<String> {
        self.check_job(job_id)?;

        let path = self.job_dir(job_id).join(OUTPUT_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = String::new();
        let mut taken = 0i64;
        for line in BufReader::new(file).lines().skip(offset) {
            if qty >= 0 && taken >= qty {
                break;
            }
            out.push_str(&line?);
            out.push('\n');
            taken += 1;
        }
        Ok(out)
    }

    /// Build a download of the job's output file or of its whole artifact
    /// directory.
    pub fn download(
        &self,
        job_id: JobId,
        content: DownloadContent,
        encoding: DownloadEncoding,
    ) -> Result<Download> {
        self.check_job(job_id)?;
        match content {
            DownloadContent::Output => self.download_output(job_id, encoding),
            DownloadContent::All => self.download_bundle(job_id),
        }
    }

    /// Stream the single output file, optionally through the incremental
    /// gzip encoder. One compressor instance per download, never shared.
    fn download_output(&self, job_id: JobId, encoding: DownloadEncoding) -> Result<Download> {
        let filename = format!("output-{job_id}");
        let path = self.job_dir(job_id).join(OUTPUT_FILE);
        let source: Box<dyn Read + Send> = match File::open(&path) {
            Ok(file) => Box::new(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Box::new(io::empty()),
            Err(e) => return Err(e.into()),
        };
        debug!(%job_id, ?encoding, "output download opened");
        Ok(match encoding {
            DownloadEncoding::Raw => Download {
                filename,
                compressed: false,
                body: DownloadBody::Stream(source),
            },
            DownloadEncoding::Gzip => Download {
                compressed: true,
                body: DownloadBody::Stream(Box::new(GzipStream::new(
                    source,
                    Some(filename.as_str()),
                ))),
                filename,
            },
        })
    }

    /// Bundle every artifact under the job's spool directory into one
    /// in-memory gzip tar attachment.
    fn download_bundle(&self, job_id: JobId) -> Result<Download> {
        let dir = self.job_dir(job_id);
        let mut builder = tar::Builder::new(Vec::new());

        if dir.is_dir() {
            for entry in WalkDir::new(&dir).sort_by_file_name() {
                let entry = entry.map_err(|e| Error::Io(io::Error::other(e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&dir)
                    .map_err(|e| Error::Io(io::Error::other(e)))?;
                builder.append_path_with_name(entry.path(), rel)?;
            }
        }
        let tarball = builder.into_inner()?;

        let mut stream = GzipStream::new(Cursor::new(tarball), None);
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes)?;
        debug!(%job_id, bytes = bytes.len(), "artifact bundle built");

        Ok(Download {
            filename: format!("job-{job_id}.tar.gz"),
            compressed: true,
            body: DownloadBody::Bytes(bytes),
        })
    }
}
