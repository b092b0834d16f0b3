// src/reader.rs
//
// Random-access reads from one S3 object via ranged GETs.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::SecondsFormat;

use crate::client::ObjectHead;
use crate::error::{FsError, Result};
use crate::io_context::IoContext;
use crate::lifecycle::ClientHolder;
use crate::path::ObjectPath;
use crate::retry::is_not_found;

/// Object metadata in `Key: Value` form, as exposed by [`ObjectReader::metadata`].
pub fn object_metadata(head: &ObjectHead) -> BTreeMap<String, String> {
    let mut md = BTreeMap::new();
    md.insert("Content-Length".to_string(), head.size.to_string());
    let mut push = |k: &str, v: &Option<String>| {
        if let Some(v) = v.as_ref().filter(|v| !v.is_empty()) {
            md.insert(k.to_string(), v.clone());
        }
    };
    push("Cache-Control", &head.cache_control);
    push("Content-Type", &head.content_type);
    push("Content-Language", &head.content_language);
    push("ETag", &head.e_tag);
    push("VersionId", &head.version_id);
    push("Expires", &head.expires);
    if let Some(ts) = head.last_modified {
        md.insert(
            "Last-Modified".to_string(),
            ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    md
}

/// A readable, seekable view of an S3 object.
#[derive(Debug)]
pub struct ObjectReader {
    holder: Option<Arc<ClientHolder>>,
    io: IoContext,
    path: ObjectPath,
    content_length: u64,
    pos: u64,
    metadata: BTreeMap<String, String>,
    closed: bool,
}

impl ObjectReader {
    /// Open `path`, issuing a HEAD so that a missing object fails here rather
    /// than on first read.
    pub(crate) async fn open(holder: Arc<ClientHolder>, io: IoContext, path: ObjectPath) -> Result<Self> {
        let outcome = io
            .run(async {
                let client = holder.lock().await?;
                Ok::<_, FsError>(client.head_object(&path.bucket, &path.key).await)
            })
            .await?;
        let head = match outcome {
            Ok(head) => head,
            Err(d) if is_not_found(&d) => return Err(FsError::NotFound(path.full_path.clone())),
            Err(d) => return Err(FsError::provider("reading information for key", path.full_path.clone(), d)),
        };
        Ok(Self {
            holder: Some(holder),
            io,
            content_length: head.size,
            metadata: object_metadata(&head),
            path,
            pos: 0,
            closed: false,
        })
    }

    /// Open with an already known size; no request is made.
    pub(crate) fn with_size(holder: Arc<ClientHolder>, io: IoContext, path: ObjectPath, size: u64) -> Self {
        Self {
            holder: Some(holder),
            io,
            path,
            content_length: size,
            pos: 0,
            metadata: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed {
            return Err(FsError::Invalid("Operation on closed stream".into()));
        }
        Ok(())
    }

    fn check_position(&self, position: i64, action: &str) -> Result<u64> {
        if position < 0 {
            return Err(FsError::Invalid(format!("Cannot {} from negative position", action)));
        }
        let position = position as u64;
        if position > self.content_length {
            return Err(FsError::Io(format!("Cannot {} past end of file", action)));
        }
        Ok(position)
    }

    /// Metadata captured at open; empty when opened with a known size.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn size(&self) -> Result<u64> {
        self.check_closed()?;
        Ok(self.content_length)
    }

    pub fn tell(&self) -> Result<u64> {
        self.check_closed()?;
        Ok(self.pos)
    }

    pub fn seek(&mut self, position: i64) -> Result<()> {
        self.check_closed()?;
        self.pos = self.check_position(position, "seek")?;
        Ok(())
    }

    /// Read up to `nbytes` at `position` without moving the cursor.
    pub async fn read_at(&self, position: i64, nbytes: u64) -> Result<Bytes> {
        self.check_closed()?;
        let position = self.check_position(position, "read")?;
        let nbytes = nbytes.min(self.content_length - position);
        if nbytes == 0 {
            return Ok(Bytes::new());
        }
        let holder = self.holder.as_ref().ok_or(FsError::SubsystemFinalized)?;
        let (bucket, key) = (&self.path.bucket, &self.path.key);
        self.io
            .run(async {
                let client = holder.lock().await?;
                Ok::<_, FsError>(client.get_object_range(bucket, key, position, nbytes).await)
            })
            .await?
            .map_err(|d| FsError::provider("reading from key", self.path.full_path.clone(), d))
    }

    /// Read up to `nbytes` at the cursor and advance it.
    pub async fn read(&mut self, nbytes: u64) -> Result<Bytes> {
        let buf = self.read_at(self.pos as i64, nbytes).await?;
        self.pos += buf.len() as u64;
        Ok(buf)
    }

    /// Read from the cursor to the end of the object in `chunk`-sized requests.
    pub async fn read_to_end(&mut self, chunk: u64) -> Result<Bytes> {
        self.check_closed()?;
        let remaining = self.content_length - self.pos;
        let mut out = BytesMut::with_capacity(remaining as usize);
        loop {
            let buf = self.read(chunk.max(1)).await?;
            if buf.is_empty() {
                break;
            }
            out.extend_from_slice(&buf);
        }
        Ok(out.freeze())
    }

    pub fn close(&mut self) {
        self.holder = None;
        self.closed = true;
    }

    pub fn closed(&self) -> bool {
        self.closed
    }
}
