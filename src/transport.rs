//! Stream wrapper that records the peer's SSH identification line.
//!
//! The SSH library consumes the version exchange itself, so the client
//! version string is picked out of the bytes as they are read.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Identification lines are at most 255 bytes including CR LF (RFC 4253 4.2)
const MAX_IDENT_LEN: usize = 255;

/// Client identification string, filled once the version exchange is read
pub type ClientVersion = Arc<OnceLock<String>>;

pub struct IdentCapture<S> {
    inner: S,
    version: ClientVersion,
    line: Vec<u8>,
    done: bool,
}

impl<S> IdentCapture<S> {
    pub fn new(inner: S) -> (Self, ClientVersion) {
        let version = ClientVersion::default();
        let stream = Self {
            inner,
            version: version.clone(),
            line: Vec::new(),
            done: false,
        };
        (stream, version)
    }

    fn observe(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.done {
                return;
            }
            if b != b'\n' {
                self.line.push(b);
                if self.line.len() > MAX_IDENT_LEN {
                    self.done = true;
                }
                continue;
            }

            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            if self.line.starts_with(b"SSH-") {
                let _ = self
                    .version
                    .set(String::from_utf8_lossy(&self.line).into_owned());
                self.done = true;
            }
            self.line.clear();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdentCapture<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if !this.done {
            if let Poll::Ready(Ok(())) = poll {
                this.observe(&buf.filled()[before..]);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdentCapture<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
