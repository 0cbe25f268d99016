//! Chunked CSV result sink over an [`UploadStore`].

use std::future::Future;

use thiserror::Error;
use tracing::debug;

use crate::uploadstore::{UploadError, UploadStore};

#[derive(Error, Debug)]
pub enum CsvError {
    #[error("Header was already written")]
    HeaderAlreadyWritten,

    #[error("Header must be written before any row")]
    HeaderMissing,

    #[error("Row has {got} columns but the header has {expected}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("Writer is already closed")]
    Closed,

    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// Destination of search results.
pub trait CsvWriter: Send {
    /// Must be called exactly once, before any row.
    fn write_header(&mut self, header: &[&str]) -> impl Future<Output = Result<(), CsvError>> + Send;

    /// `row` must have as many values as the header.
    fn write_row(&mut self, row: &[&str]) -> impl Future<Output = Result<(), CsvError>> + Send;
}

/// Writes rows into objects named `{prefix}`, `{prefix}-1`, `{prefix}-2`, ...
///
/// A new object is started, carrying the same header, whenever the next row would
/// push the buffered object past `max_blob_size_bytes`. A row larger than the limit
/// still gets an object of its own.
pub struct BlobstoreCsvWriter<U: UploadStore> {
    store: U,
    key_prefix: String,
    max_blob_size_bytes: usize,
    header: Option<Vec<String>>,
    buf: Vec<u8>,
    rows_in_buf: usize,
    objects_uploaded: usize,
    closed: bool,
}

/// Default size limit of one uploaded object.
pub const DEFAULT_MAX_BLOB_SIZE_BYTES: usize = 100 * 1024 * 1024;

impl<U: UploadStore> BlobstoreCsvWriter<U> {
    pub fn new(store: U, key_prefix: impl Into<String>, max_blob_size_bytes: usize) -> Self {
        BlobstoreCsvWriter {
            store,
            key_prefix: key_prefix.into(),
            max_blob_size_bytes,
            header: None,
            buf: Vec::new(),
            rows_in_buf: 0,
            objects_uploaded: 0,
            closed: false,
        }
    }

    pub fn objects_uploaded(&self) -> usize {
        self.objects_uploaded
    }

    fn current_key(&self) -> String {
        match self.objects_uploaded {
            0 => self.key_prefix.clone(),
            n => format!("{}-{}", self.key_prefix, n),
        }
    }

    fn start_object(&mut self) {
        self.buf.clear();
        self.rows_in_buf = 0;
        if let Some(header) = &self.header {
            encode_record(&mut self.buf, header.iter().map(String::as_str));
        }
    }

    async fn flush(&mut self) -> Result<(), CsvError> {
        let key = self.current_key();
        let data = std::mem::take(&mut self.buf);
        let written = self.store.upload(&key, data).await?;
        debug!(key, written, rows = self.rows_in_buf, "Uploaded result object");
        self.objects_uploaded += 1;
        self.start_object();
        Ok(())
    }

    /// Uploads any buffered rows. An empty result still produces one object holding
    /// the header. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), CsvError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.header.is_none() {
            return Ok(());
        }
        if self.rows_in_buf > 0 || self.objects_uploaded == 0 {
            self.flush().await?;
        }
        Ok(())
    }
}

impl<U: UploadStore> CsvWriter for BlobstoreCsvWriter<U> {
    async fn write_header(&mut self, header: &[&str]) -> Result<(), CsvError> {
        if self.closed {
            return Err(CsvError::Closed);
        }
        if self.header.is_some() {
            return Err(CsvError::HeaderAlreadyWritten);
        }

        self.header = Some(header.iter().map(|h| h.to_string()).collect());
        self.start_object();
        Ok(())
    }

    async fn write_row(&mut self, row: &[&str]) -> Result<(), CsvError> {
        if self.closed {
            return Err(CsvError::Closed);
        }
        let expected = match &self.header {
            Some(header) => header.len(),
            None => return Err(CsvError::HeaderMissing),
        };
        if row.len() != expected {
            return Err(CsvError::ArityMismatch {
                expected,
                got: row.len(),
            });
        }

        let mut encoded = Vec::new();
        encode_record(&mut encoded, row.iter().copied());

        if self.rows_in_buf > 0 && self.buf.len() + encoded.len() > self.max_blob_size_bytes {
            self.flush().await?;
        }

        self.buf.extend_from_slice(&encoded);
        self.rows_in_buf += 1;
        Ok(())
    }
}

/// Appends one RFC 4180 record terminated by `\n`.
pub(crate) fn encode_record<'a>(buf: &mut Vec<u8>, fields: impl Iterator<Item = &'a str>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        encode_field(buf, field);
    }
    buf.push(b'\n');
}

fn encode_field(buf: &mut Vec<u8>, field: &str) {
    let needs_quotes = field.starts_with(' ')
        || field
            .bytes()
            .any(|b| matches!(b, b',' | b'"' | b'\r' | b'\n'));

    if !needs_quotes {
        buf.extend_from_slice(field.as_bytes());
        return;
    }

    buf.push(b'"');
    for b in field.bytes() {
        if b == b'"' {
            buf.push(b'"');
        }
        buf.push(b);
    }
    buf.push(b'"');
}
