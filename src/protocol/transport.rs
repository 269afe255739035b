//! Length-prefixed framing over a blocking byte stream.

use super::command::Response;
use super::MAX_FRAME_LEN;
use crate::error::{PatchError, ProtocolError};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Inbound half of a connection.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.inner.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => ProtocolError::Closed,
            _ => ProtocolError::Io(e),
        })
    }

    pub fn read_int(&mut self) -> Result<i32, ProtocolError> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read a raw opcode. Validation against the opcode set is the caller's job.
    pub fn read_opcode(&mut self) -> Result<u32, ProtocolError> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a length-prefixed blob. `Ok(None)` means the peer sent "absent".
    pub fn read_blob(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let len = self.read_int()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        let mut buf = vec![0u8; len];
        self.fill(&mut buf)?;
        Ok(Some(buf))
    }

    pub fn read_string(&mut self) -> Result<Option<String>, ProtocolError> {
        match self.read_blob()? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| ProtocolError::InvalidUtf8),
            None => Ok(None),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Outbound half of a connection.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_int(&mut self, value: i32) -> std::io::Result<()> {
        self.inner.write_all(&value.to_le_bytes())
    }

    pub fn write_opcode(&mut self, code: u32) -> std::io::Result<()> {
        self.inner.write_all(&code.to_le_bytes())
    }

    pub fn write_blob(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let len = i32::try_from(bytes.len())
            .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "frame too large"))?;
        self.write_int(len)?;
        self.inner.write_all(bytes)
    }

    pub fn write_string(&mut self, s: &str) -> std::io::Result<()> {
        self.write_blob(s.as_bytes())
    }

    /// Encode an absent string/blob.
    pub fn write_absent(&mut self) -> std::io::Result<()> {
        self.write_int(-1)
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

type BoxedWriter = FrameWriter<Box<dyn Write + Send>>;

/// Cloneable handle to the outbound half, shared by the read loop, the patch
/// pipeline and the serialized context. Each message is written under a
/// single lock acquisition so frames never interleave.
#[derive(Clone)]
pub struct Outbound {
    inner: Arc<Mutex<BoxedWriter>>,
}

impl Outbound {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FrameWriter::new(Box::new(writer)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoxedWriter> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Write one logical message and flush it.
    pub fn write_with<F>(&self, f: F) -> std::io::Result<()>
    where
        F: FnOnce(&mut BoxedWriter) -> std::io::Result<()>,
    {
        let mut guard = self.lock();
        f(&mut guard)?;
        guard.flush()
    }

    /// `writeCommand(code, with: payload)`: the opcode, then the string if present.
    pub fn send(&self, response: Response, payload: Option<&str>) -> std::io::Result<()> {
        self.write_with(|w| {
            w.write_opcode(response as u32)?;
            if let Some(payload) = payload {
                w.write_string(payload)?;
            }
            Ok(())
        })
    }

    /// Acknowledge a patch request: bare `Complete`, or `Error` plus message.
    pub fn send_completion(&self, result: &Result<(), PatchError>) -> std::io::Result<()> {
        match result {
            Ok(()) => self.send(Response::Complete, None),
            Err(e) => self.send(Response::Error, Some(&e.completion_message())),
        }
    }
}
