//! Replayable request payloads.
//!
//! # Design
//! A request may be sent more than once, so the body is opened afresh for
//! every attempt. Bytes and generator bodies are replayable by construction.
//! A single-shot reader is teed into a shared buffer while the first attempt
//! streams it; a later attempt drains whatever the first attempt left unread
//! and is then served from the buffer. Nothing else is buffered implicitly.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use parking_lot::Mutex;

type StreamFactory = dyn Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync;

/// Body of an outbound request.
#[derive(Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Exact bytes, always replayable.
    Bytes(Arc<[u8]>),
    /// Factory producing an independent stream per attempt. Unknown length
    /// means chunked transfer.
    Generator {
        factory: Arc<StreamFactory>,
        length: Option<u64>,
    },
    /// A stream that can only be read once; teed on first use.
    SingleShot(SingleShot),
}

impl RequestBody {
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        RequestBody::Bytes(Arc::from(bytes.into()))
    }

    pub fn generator<F>(length: Option<u64>, factory: F) -> Self
    where
        F: Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync + 'static,
    {
        RequestBody::Generator {
            factory: Arc::new(factory),
            length,
        }
    }

    pub fn single_shot(reader: impl Read + Send + 'static, length: Option<u64>) -> Self {
        RequestBody::SingleShot(SingleShot {
            shared: Arc::new(Mutex::new(TeeState {
                source: Some(Box::new(reader)),
                buffer: Vec::new(),
                opened: false,
            })),
            length,
        })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }

    /// Length in bytes, when known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(bytes) => Some(bytes.len() as u64),
            RequestBody::Generator { length, .. } => *length,
            RequestBody::SingleShot(single) => single.length,
        }
    }

    /// Produces the body for one attempt.
    pub fn open(&self) -> io::Result<AttemptBody> {
        match self {
            RequestBody::Empty => Ok(AttemptBody::Empty),
            RequestBody::Bytes(bytes) => Ok(AttemptBody::Bytes(Arc::clone(bytes))),
            RequestBody::Generator { factory, length } => Ok(AttemptBody::Stream {
                reader: factory()?,
                length: *length,
            }),
            RequestBody::SingleShot(single) => single.open(),
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::bytes(bytes)
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::bytes(text.into_bytes())
    }
}

impl From<&str> for RequestBody {
    fn from(text: &str) -> Self {
        RequestBody::bytes(text.as_bytes().to_vec())
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(bytes) => write!(f, "Bytes({})", bytes.len()),
            RequestBody::Generator { length, .. } => write!(f, "Generator({length:?})"),
            RequestBody::SingleShot(single) => write!(f, "SingleShot({:?})", single.length),
        }
    }
}

/// Shared handle to a one-shot stream and the bytes read from it so far.
#[derive(Clone)]
pub struct SingleShot {
    shared: Arc<Mutex<TeeState>>,
    length: Option<u64>,
}

struct TeeState {
    source: Option<Box<dyn Read + Send>>,
    buffer: Vec<u8>,
    opened: bool,
}

impl SingleShot {
    fn open(&self) -> io::Result<AttemptBody> {
        let mut state = self.shared.lock();
        if !state.opened {
            state.opened = true;
            return Ok(AttemptBody::Stream {
                reader: Box::new(TeeReader {
                    shared: Arc::clone(&self.shared),
                }),
                length: self.length,
            });
        }
        if let Some(mut source) = state.source.take() {
            let mut rest = Vec::new();
            source.read_to_end(&mut rest)?;
            state.buffer.extend_from_slice(&rest);
        }
        Ok(AttemptBody::Bytes(Arc::from(state.buffer.as_slice())))
    }
}

struct TeeReader {
    shared: Arc<Mutex<TeeState>>,
}

impl Read for TeeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        let TeeState { source, buffer, .. } = &mut *state;
        let Some(reader) = source.as_mut() else {
            return Ok(0);
        };
        let n = reader.read(buf)?;
        if n == 0 {
            *source = None;
        } else {
            buffer.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}

/// The body handed to a `Connection` for a single attempt.
pub enum AttemptBody {
    Empty,
    Bytes(Arc<[u8]>),
    Stream {
        reader: Box<dyn Read + Send>,
        length: Option<u64>,
    },
}

impl AttemptBody {
    pub fn len(&self) -> Option<u64> {
        match self {
            AttemptBody::Empty => Some(0),
            AttemptBody::Bytes(bytes) => Some(bytes.len() as u64),
            AttemptBody::Stream { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn into_reader(self) -> Box<dyn Read + Send> {
        match self {
            AttemptBody::Empty => Box::new(io::empty()),
            AttemptBody::Bytes(bytes) => Box::new(io::Cursor::new(bytes)),
            AttemptBody::Stream { reader, .. } => reader,
        }
    }

    /// Reads the whole attempt body. Used by in-memory connections.
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.into_reader().read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// A reader that refuses to be rewound: it hands out its data once.
    struct Pipe(io::Cursor<Vec<u8>>);

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // Small reads so partial consumption can be exercised.
            let len = buf.len().min(3);
            self.0.read(&mut buf[..len])
        }
    }

    #[test]
    fn bytes_body_reopens_identically() {
        let body = RequestBody::from("{\"_id\":\"doc\"}");
        let first = body.open().unwrap().into_bytes().unwrap();
        let second = body.open().unwrap().into_bytes().unwrap();
        assert_eq!(first, second);
        assert_eq!(body.len(), Some(13));
    }

    #[test]
    fn generator_produces_fresh_stream_per_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let body = RequestBody::generator(None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(io::Cursor::new(b"chunked".to_vec())) as Box<dyn Read + Send>)
        });

        assert_eq!(body.open().unwrap().into_bytes().unwrap(), b"chunked");
        assert_eq!(body.open().unwrap().into_bytes().unwrap(), b"chunked");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(body.len(), None);
    }

    #[test]
    fn single_shot_replays_fully_read_stream() {
        let body = RequestBody::single_shot(Pipe(io::Cursor::new(b"attachment-bytes".to_vec())), None);
        let first = body.open().unwrap().into_bytes().unwrap();
        let second = body.open().unwrap().into_bytes().unwrap();
        let third = body.open().unwrap().into_bytes().unwrap();
        assert_eq!(first, b"attachment-bytes");
        assert_eq!(second, first);
        assert_eq!(third, first);
    }

    #[test]
    fn single_shot_replay_completes_partially_read_stream() {
        let body = RequestBody::single_shot(Pipe(io::Cursor::new(b"0123456789".to_vec())), Some(10));

        let mut first = body.open().unwrap().into_reader();
        let mut head = [0u8; 3];
        first.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"012");
        drop(first);

        let replay = body.open().unwrap();
        assert_eq!(replay.len(), Some(10));
        assert_eq!(replay.into_bytes().unwrap(), b"0123456789");
    }

    #[test]
    fn empty_body_has_zero_length() {
        let body = RequestBody::default();
        assert!(body.is_empty());
        assert!(body.open().unwrap().is_empty());
    }
}
