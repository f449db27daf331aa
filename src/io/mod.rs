//! Raw stream traits and the timed adapters that bind them to the
//! watchdog-driven timeout machinery.

use std::{io, sync::Arc, time::Duration};

use cancellation_scope::{scope, CancelToken};

use crate::{errors::Error, timeout::AsyncTimeout};

mod buffer;

pub use buffer::{Buffer, SEGMENT_SIZE};


/// Largest byte count handed to one underlying write call. Sized so each
/// chunk's deadline exposure stays bounded: a slow-but-progressing peer
/// re-scores its deadline once per chunk instead of having one deadline
/// cover an arbitrarily large write.
pub const CHUNK_CEILING: u64 = 4 * SEGMENT_SIZE as u64;


/// A blocking byte source.
pub trait RawReader {
    /// Read up to `byte_count` bytes into `sink`. Returns the number of
    /// bytes read; `Ok(0)` with a nonzero `byte_count` means the stream
    /// is exhausted.
    fn read_at_most_to(&mut self, sink: &mut Buffer, byte_count: u64) -> Result<u64, Error>;

    /// Close the reading half of the underlying stream.
    fn close(&mut self) -> Result<(), Error>;
}

/// A blocking byte sink.
pub trait RawWriter {
    /// Remove exactly `byte_count` bytes from `source` and write them.
    fn write_from(&mut self, source: &mut Buffer, byte_count: u64) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error>;

    /// Close the writing half of the underlying stream.
    fn close(&mut self) -> Result<(), Error>;
}


/// Restores a token's per-operation timeout when the operation is left,
/// including by unwinding.
struct TimeoutSwap {
    token: CancelToken,
    previous: Duration,
}

impl TimeoutSwap {
    fn apply(token: CancelToken, timeout: Duration) -> Self {
        let previous = token.set_timeout(timeout);
        Self { token, previous }
    }
}

impl Drop for TimeoutSwap {
    fn drop(&mut self) {
        self.token.set_timeout(self.previous);
    }
}

/// The per-call policy shared by the timed adapters.
///
/// With a scope active on this thread, the adapter's configured default
/// temporarily replaces the token's per-operation timeout (the token's
/// deadline still applies). Without a scope, a zero default calls through
/// with no bookkeeping at all; a nonzero default lets the timeout slot
/// mint a temporary token for the duration of the call.
fn with_operation_timeout<T>(
    timeout: &AsyncTimeout,
    default_timeout: Duration,
    op: impl FnOnce() -> Result<T, Error>,
) -> Result<T, Error> {
    match scope::current() {
        Some(token) => {
            let _swap = TimeoutSwap::apply(token, default_timeout);
            timeout.with_timeout(default_timeout, op)
        }
        None if default_timeout.is_zero() => op(),
        None => timeout.with_timeout(default_timeout, op),
    }
}


/// A reader whose every call runs under the deadline slot of its
/// endpoint.
pub struct TimedReader<R: RawReader> {
    timeout: Arc<AsyncTimeout>,
    inner: R,
    read_timeout: Duration,
}

impl<R: RawReader> TimedReader<R> {
    pub(crate) fn new(timeout: Arc<AsyncTimeout>, inner: R, read_timeout: Duration) -> Self {
        Self {
            timeout,
            inner,
            read_timeout,
        }
    }
}

impl<R: RawReader> RawReader for TimedReader<R> {
    fn read_at_most_to(&mut self, sink: &mut Buffer, byte_count: u64) -> Result<u64, Error> {
        let Self {
            timeout,
            inner,
            read_timeout,
        } = self;

        with_operation_timeout(timeout, *read_timeout, || {
            inner.read_at_most_to(sink, byte_count)
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        let Self {
            timeout,
            inner,
            read_timeout,
        } = self;

        with_operation_timeout(timeout, *read_timeout, || inner.close())
    }
}


/// A writer whose every call runs under the deadline slot of its
/// endpoint, with large writes split at segment boundaries.
pub struct TimedWriter<W: RawWriter> {
    timeout: Arc<AsyncTimeout>,
    inner: W,
    write_timeout: Duration,
}

impl<W: RawWriter> TimedWriter<W> {
    pub(crate) fn new(timeout: Arc<AsyncTimeout>, inner: W, write_timeout: Duration) -> Self {
        Self {
            timeout,
            inner,
            write_timeout,
        }
    }
}

impl<W: RawWriter> RawWriter for TimedWriter<W> {
    fn write_from(&mut self, source: &mut Buffer, byte_count: u64) -> Result<(), Error> {
        if byte_count > source.size() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write byte count exceeds the buffered bytes",
            )));
        }

        let mut remaining = byte_count;
        while remaining > 0 {
            // Walk whole segments until the chunk covers what is left or
            // reaches the ceiling. The final chunk may be short.
            let mut chunk: u64 = 0;
            for segment_len in source.segment_lengths() {
                chunk += segment_len as u64;
                if chunk >= remaining {
                    chunk = remaining;
                    break;
                }
                if chunk >= CHUNK_CEILING {
                    break;
                }
            }

            let Self {
                timeout,
                inner,
                write_timeout,
            } = self;
            with_operation_timeout(timeout, *write_timeout, || inner.write_from(source, chunk))?;

            remaining -= chunk;
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        let Self {
            timeout,
            inner,
            write_timeout,
        } = self;

        with_operation_timeout(timeout, *write_timeout, || inner.flush())
    }

    fn close(&mut self) -> Result<(), Error> {
        let Self {
            timeout,
            inner,
            write_timeout,
        } = self;

        with_operation_timeout(timeout, *write_timeout, || inner.close())
    }
}


/// A reader/writer pair presented as one duplex stream, e.g. for a
/// protocol handshake that talks both directions over one connection.
pub struct Duplex<R: RawReader, W: RawWriter> {
    reader: R,
    writer: W,
}

impl<R: RawReader, W: RawWriter> Duplex<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl<R: RawReader, W: RawWriter> RawReader for Duplex<R, W> {
    fn read_at_most_to(&mut self, sink: &mut Buffer, byte_count: u64) -> Result<u64, Error> {
        self.reader.read_at_most_to(sink, byte_count)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.reader.close()
    }
}

impl<R: RawReader, W: RawWriter> RawWriter for Duplex<R, W> {
    fn write_from(&mut self, source: &mut Buffer, byte_count: u64) -> Result<(), Error> {
        self.writer.write_from(source, byte_count)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.writer.close()
    }
}


#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use cancellation_scope::Cancellable;

    use super::*;

    struct RecordingWriter {
        calls: Vec<u64>,
    }

    impl RecordingWriter {
        fn new() -> Self {
            Self { calls: Vec::new() }
        }
    }

    impl RawWriter for RecordingWriter {
        fn write_from(&mut self, source: &mut Buffer, byte_count: u64) -> Result<(), Error> {
            self.calls.push(byte_count);
            source.skip(byte_count);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    struct StaticReader {
        bytes: Vec<u8>,
    }

    impl RawReader for StaticReader {
        fn read_at_most_to(&mut self, sink: &mut Buffer, byte_count: u64) -> Result<u64, Error> {
            let take = (byte_count as usize).min(self.bytes.len());
            let chunk: Vec<u8> = self.bytes.drain(..take).collect();
            sink.write_slice(&chunk);
            Ok(take as u64)
        }

        fn close(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn timed_writer(write_timeout: Duration) -> TimedWriter<RecordingWriter> {
        let timeout = Arc::new(AsyncTimeout::new(|| Ok(())));
        timeout.wrap_writer(RecordingWriter::new(), write_timeout)
    }

    #[test]
    fn one_mebibyte_splits_into_sixteen_full_chunks() {
        let mut writer = timed_writer(Duration::from_millis(100));

        let mut source = Buffer::new();
        source.write_slice(&vec![0u8; 1024 * 1024]);

        writer.write_from(&mut source, 1024 * 1024).unwrap();

        assert_eq!(writer.inner.calls, vec![CHUNK_CEILING; 16]);
        assert!(source.is_empty());
    }

    #[test]
    fn final_chunk_may_be_short() {
        let mut writer = timed_writer(Duration::from_millis(100));

        let mut source = Buffer::new();
        source.write_slice(&vec![0u8; 100_000]);

        writer.write_from(&mut source, 100_000).unwrap();

        assert_eq!(writer.inner.calls, vec![65_536, 34_464]);
    }

    #[test]
    fn small_writes_are_not_split() {
        let mut writer = timed_writer(Duration::ZERO);

        let mut source = Buffer::new();
        source.write_slice(b"small payload");

        writer.write_from(&mut source, 13).unwrap();

        assert_eq!(writer.inner.calls, vec![13]);
    }

    #[test]
    fn writing_more_than_is_buffered_is_rejected() {
        let mut writer = timed_writer(Duration::ZERO);

        let mut source = Buffer::new();
        source.write_slice(b"abc");

        let result = writer.write_from(&mut source, 99);
        assert_matches!(result, Err(Error::Io(_)));
    }

    #[test]
    fn reader_swaps_and_restores_the_scope_timeout() {
        let timeout = Arc::new(AsyncTimeout::new(|| Ok(())));
        let mut reader = timeout.wrap_reader(
            StaticReader {
                bytes: b"payload".to_vec(),
            },
            Duration::from_secs(1),
        );

        Cancellable::run(Duration::from_secs(30), |token| {
            let mut sink = Buffer::new();
            let read = reader.read_at_most_to(&mut sink, 7).unwrap();

            assert_eq!(read, 7);
            assert_eq!(sink.read_to_vec(7), b"payload");
            assert_eq!(token.timeout(), Duration::from_secs(30));
        });
    }

    #[test]
    fn zero_default_without_a_scope_calls_straight_through() {
        let timeout = Arc::new(AsyncTimeout::new(|| Ok(())));
        let mut reader = timeout.wrap_reader(StaticReader { bytes: Vec::new() }, Duration::ZERO);

        let mut sink = Buffer::new();
        assert_eq!(reader.read_at_most_to(&mut sink, 16).unwrap(), 0);
    }
}
