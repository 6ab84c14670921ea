//! In-memory duplex pipe transport.
//!
//! [`pair`] yields two connected [`PipeEnd`]s; bytes written to one end
//! are read from the other, with blocking, bounded buffering in each
//! direction. Used by the integration tests to wire two endpoints
//! together without sockets, and usable in production for same-process
//! component pairs.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::transport::{ChannelTransport, CloseHook};

struct DirectionState {
    buffer: VecDeque<u8>,
    capacity: usize,
    /// Writer half dropped or closed: reader sees EOF after draining.
    write_closed: bool,
    /// Reader half dropped or closed: writer gets broken-pipe.
    read_closed: bool,
}

/// One direction of the pipe: a bounded byte queue.
struct Direction {
    state: Mutex<DirectionState>,
    changed: Condvar,
}

impl Direction {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DirectionState {
                buffer: VecDeque::new(),
                capacity,
                write_closed: false,
                read_closed: false,
            }),
            changed: Condvar::new(),
        })
    }

    fn close_write(&self) {
        self.state.lock().write_closed = true;
        self.changed.notify_all();
    }

    fn close_read(&self) {
        self.state.lock().read_closed = true;
        self.changed.notify_all();
    }
}

/// Reader half of one pipe direction.
pub struct PipeReader {
    direction: Arc<Direction>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.direction.state.lock();
        loop {
            if state.read_closed {
                return Ok(0);
            }
            if !state.buffer.is_empty() {
                let n = buf.len().min(state.buffer.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.buffer.pop_front().unwrap_or_default();
                }
                drop(state);
                self.direction.changed.notify_all();
                return Ok(n);
            }
            if state.write_closed {
                return Ok(0);
            }
            self.direction.changed.wait(&mut state);
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.direction.close_read();
    }
}

/// Writer half of one pipe direction.
pub struct PipeWriter {
    direction: Arc<Direction>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.direction.state.lock();
        loop {
            if state.read_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe reader closed",
                ));
            }
            if state.write_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe writer closed",
                ));
            }
            let space = state.capacity - state.buffer.len();
            if space > 0 {
                let n = buf.len().min(space);
                state.buffer.extend(&buf[..n]);
                drop(state);
                self.direction.changed.notify_all();
                return Ok(n);
            }
            self.direction.changed.wait(&mut state);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.direction.close_write();
    }
}

/// One end of an in-memory duplex pipe.
///
/// Dropping an end closes both of its directions; the peer's reader sees
/// EOF and its writer gets a broken-pipe error, mirroring a closed
/// socket.
pub struct PipeEnd {
    reader: PipeReader,
    writer: PipeWriter,
}

impl ChannelTransport for PipeEnd {
    type Reader = PipeReader;
    type Writer = PipeWriter;

    fn into_parts(self) -> io::Result<(Self::Reader, Self::Writer, CloseHook)> {
        let incoming = Arc::clone(&self.reader.direction);
        let outgoing = Arc::clone(&self.writer.direction);
        let hook: CloseHook = Box::new(move || {
            incoming.close_read();
            outgoing.close_write();
        });
        Ok((self.reader, self.writer, hook))
    }
}

/// Create a connected pair of pipe ends with the given per-direction
/// buffer capacity in bytes.
pub fn pair(capacity: usize) -> (PipeEnd, PipeEnd) {
    let a_to_b = Direction::new(capacity.max(1));
    let b_to_a = Direction::new(capacity.max(1));
    let a = PipeEnd {
        reader: PipeReader {
            direction: Arc::clone(&b_to_a),
        },
        writer: PipeWriter {
            direction: Arc::clone(&a_to_b),
        },
    };
    let b = PipeEnd {
        reader: PipeReader {
            direction: a_to_b,
        },
        writer: PipeWriter {
            direction: b_to_a,
        },
    };
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_cross_the_pipe() {
        let (a, b) = pair(64);
        let (_ra, mut wa, _hook_a) = a.into_parts().expect("split a");
        let (mut rb, _wb, _hook_b) = b.into_parts().expect("split b");

        wa.write_all(b"hello").expect("write");
        let mut buf = [0u8; 5];
        rb.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_reader_sees_eof_after_writer_drop() {
        let (a, b) = pair(64);
        let (_ra, wa, _hook_a) = a.into_parts().expect("split a");
        let (mut rb, _wb, _hook_b) = b.into_parts().expect("split b");

        drop(wa);
        let mut buf = [0u8; 1];
        assert_eq!(rb.read(&mut buf).expect("read"), 0);
    }

    #[test]
    fn test_writer_fails_after_peer_drop() {
        let (a, b) = pair(64);
        let (_ra, mut wa, _hook_a) = a.into_parts().expect("split a");
        drop(b);

        let err = wa.write(b"x").expect_err("write should fail");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_bounded_buffer_blocks_and_resumes() {
        let (a, b) = pair(4);
        let (_ra, mut wa, _hook_a) = a.into_parts().expect("split a");
        let (mut rb, _wb, _hook_b) = b.into_parts().expect("split b");

        let writer = std::thread::spawn(move || {
            wa.write_all(&[7u8; 32]).expect("write all");
        });

        let mut got = Vec::new();
        let mut buf = [0u8; 8];
        while got.len() < 32 {
            let n = rb.read(&mut buf).expect("read");
            got.extend_from_slice(&buf[..n]);
        }
        writer.join().expect("writer thread");
        assert_eq!(got, vec![7u8; 32]);
    }

    #[test]
    fn test_close_hook_unblocks_reader() {
        let (a, _b_alive) = pair(16);
        let (mut ra, _wa, hook) = a.into_parts().expect("split a");

        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            ra.read(&mut buf).expect("read returns")
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        hook();
        assert_eq!(reader.join().expect("reader thread"), 0);
    }
}
