//! Byte-stream transports a channel can run over.
//!
//! A [`ChannelTransport`] is anything that splits into a blocking reader
//! half, a blocking writer half, and a close hook the channel invokes at
//! termination to unblock a pending read on the reader thread.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// Hook that tears the transport down, unblocking any pending read.
pub type CloseHook = Box<dyn Fn() + Send + Sync>;

/// A duplex byte stream usable as a channel transport.
pub trait ChannelTransport: Send + 'static {
    /// Blocking reader half.
    type Reader: Read + Send + 'static;
    /// Blocking writer half.
    type Writer: Write + Send + 'static;

    /// Split into reader, writer, and close hook.
    ///
    /// # Errors
    ///
    /// Returns any I/O error raised while splitting (e.g. a failed
    /// socket handle clone).
    fn into_parts(self) -> io::Result<(Self::Reader, Self::Writer, CloseHook)>;
}

impl ChannelTransport for TcpStream {
    type Reader = TcpStream;
    type Writer = TcpStream;

    fn into_parts(self) -> io::Result<(Self::Reader, Self::Writer, CloseHook)> {
        let reader = self.try_clone()?;
        let closer = self.try_clone()?;
        let hook: CloseHook = Box::new(move || {
            // Best effort; the socket may already be gone.
            let _ = closer.shutdown(Shutdown::Both);
        });
        Ok((reader, self, hook))
    }
}
