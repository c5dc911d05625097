//! A replay cache in front of a single-pass byte stream.
//!
//! Uploads that fail mid-stream need to restart from an earlier offset, but
//! most sources (network bodies, pipes) cannot seek. [`RepeatableReader`]
//! passes reads through once, appending everything to an internal buffer, so
//! a retry can rewind to any offset that has already gone past. Seeking
//! beyond the buffered end is an error. Not thread-safe: one outstanding
//! reader per transfer.

use crate::Reader;

pub struct RepeatableReader {
    inner: Reader,
    buf: Vec<u8>,
    pos: usize,
}

impl RepeatableReader {
    pub fn new(inner: Reader) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Number of bytes that have passed through and can be replayed.
    pub fn buffered(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Rewind to `offset`, which must lie within the buffered region.
    pub fn rewind(&mut self, offset: u64) -> std::io::Result<()> {
        if offset > self.buf.len() as u64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "offset {} is beyond the {} buffered bytes",
                    offset,
                    self.buf.len()
                ),
            ));
        }
        self.pos = offset as usize;
        Ok(())
    }
}

impl tokio::io::AsyncRead for RepeatableReader {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        out: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        // serve from the cache first
        if this.pos < this.buf.len() {
            let n = out.remaining().min(this.buf.len() - this.pos);
            out.put_slice(&this.buf[this.pos..this.pos + n]);
            this.pos += n;
            return std::task::Poll::Ready(Ok(()));
        }
        let before = out.filled().len();
        match std::pin::Pin::new(&mut this.inner).poll_read(cx, out) {
            std::task::Poll::Ready(Ok(())) => {
                let fresh = &out.filled()[before..];
                this.buf.extend_from_slice(fresh);
                this.pos += fresh.len();
                std::task::Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl tokio::io::AsyncSeek for RepeatableReader {
    fn start_seek(
        self: std::pin::Pin<&mut Self>,
        position: std::io::SeekFrom,
    ) -> std::io::Result<()> {
        let this = self.get_mut();
        let abs = match position {
            std::io::SeekFrom::Start(offset) => offset as i64,
            std::io::SeekFrom::Current(offset) => this.pos as i64 + offset,
            std::io::SeekFrom::End(offset) => this.buf.len() as i64 + offset,
        };
        if abs < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        }
        this.rewind(abs as u64)
    }

    fn poll_complete(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<u64>> {
        std::task::Poll::Ready(Ok(self.pos as u64))
    }
}
