use std::marker::Unpin;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::OnceCell;

use crate::hash::FileHasher;

/// The hex digest and byte count of a fully-read stream.
pub type HashResult = Arc<OnceCell<(String, u64)>>;

/// AsyncRead filter that hashes the bytes that have been read.
///
/// The digest is finalized when EOF is reached. If the stream errors
/// or is dropped early, the cell stays empty.
pub struct HashReader<R>
where
    R: AsyncRead + Unpin,
{
    inner: R,
    hasher: Option<FileHasher>,
    bytes_read: u64,
    finalized: HashResult,
}

impl<R> HashReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, hasher: FileHasher) -> (Self, HashResult) {
        let finalized = Arc::new(OnceCell::new());

        (
            Self {
                inner,
                hasher: Some(hasher),
                bytes_read: 0,
                finalized: finalized.clone(),
            },
            finalized,
        )
    }

    /// Returns the number of bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl<R> AsyncRead for HashReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<tokio::io::Result<()>> {
        let old_filled = buf.filled().len();
        let r = Pin::new(&mut self.inner).poll_read(cx, buf);
        let read_len = buf.filled().len() - old_filled;

        if let Poll::Ready(Ok(())) = r {
            if read_len == 0 {
                // EOF
                if let Some(hasher) = self.hasher.take() {
                    let bytes_read = self.bytes_read;
                    let _ = self.finalized.set((hasher.finalize_hex(), bytes_read));
                }
            } else if let Some(hasher) = self.hasher.as_mut() {
                let filled = buf.filled();
                hasher.update(&filled[filled.len() - read_len..]);
                self.bytes_read += read_len as u64;
            }
        }

        r
    }
}
