//! Marshalling streams
//!
//! All integers are little-endian. Sizes use the compact form: one byte
//! below 255, otherwise `255` followed by an `i32`.

use crate::error::{ProtocolError, Result};
use crate::identity::Identity;
use crate::protocol::{Context, EncodingVersion, Encapsulation};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Output stream backed by a growable buffer
#[derive(Debug, Default)]
pub struct OutputStream {
    buf: BytesMut,
}

impl OutputStream {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn write_size(&mut self, size: usize) {
        if size < 255 {
            self.buf.put_u8(size as u8);
        } else {
            self.buf.put_u8(255);
            self.buf.put_i32_le(size as i32);
        }
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_size(s.len());
        self.buf.put_slice(s.as_bytes());
    }

    pub fn write_string_seq(&mut self, seq: &[String]) {
        self.write_size(seq.len());
        for s in seq {
            self.write_string(s);
        }
    }

    pub fn write_context(&mut self, ctx: &Context) {
        self.write_size(ctx.len());
        for (k, v) in ctx {
            self.write_string(k);
            self.write_string(v);
        }
    }

    pub fn write_identity(&mut self, id: &Identity) {
        self.write_string(&id.name);
        self.write_string(&id.category);
    }

    /// Facets travel as a sequence of zero or one strings.
    pub fn write_facet(&mut self, facet: &str) {
        if facet.is_empty() {
            self.write_size(0);
        } else {
            self.write_size(1);
            self.write_string(facet);
        }
    }

    pub fn write_encapsulation(&mut self, encaps: &Encapsulation) {
        self.buf
            .put_i32_le((encaps.data.len() + Encapsulation::HEADER_SIZE) as i32);
        self.buf.put_u8(encaps.encoding.major);
        self.buf.put_u8(encaps.encoding.minor);
        self.buf.put_slice(&encaps.data);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Overwrite an `i32` previously written at `pos`.
    pub fn rewrite_i32(&mut self, pos: usize, v: i32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Input stream over an immutable frame; slices share the frame's buffer.
#[derive(Debug, Clone)]
pub struct InputStream {
    buf: Bytes,
}

impl InputStream {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::BufferUnderflow {
                needed: n,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_size(&mut self) -> Result<usize> {
        let b = self.read_u8()?;
        if b < 255 {
            return Ok(b as usize);
        }
        let v = self.read_i32()?;
        if v < 0 {
            return Err(ProtocolError::NegativeSize(v));
        }
        Ok(v as usize)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_size()?;
        let raw = self.read_bytes(len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    pub fn read_string_seq(&mut self) -> Result<Vec<String>> {
        let n = self.read_size()?;
        // Every element needs at least one byte, so a bogus count fails fast.
        self.need(n)?;
        (0..n).map(|_| self.read_string()).collect()
    }

    pub fn read_context(&mut self) -> Result<Context> {
        let n = self.read_size()?;
        self.need(n.saturating_mul(2))?;
        let mut ctx = Context::new();
        for _ in 0..n {
            let k = self.read_string()?;
            let v = self.read_string()?;
            ctx.insert(k, v);
        }
        Ok(ctx)
    }

    pub fn read_identity(&mut self) -> Result<Identity> {
        let name = self.read_string()?;
        let category = self.read_string()?;
        Ok(Identity { category, name })
    }

    pub fn read_facet(&mut self) -> Result<String> {
        let mut facets = self.read_string_seq()?;
        match facets.len() {
            0 => Ok(String::new()),
            1 => Ok(facets.remove(0)),
            n => Err(ProtocolError::InvalidEncapsulation(format!(
                "facet sequence has {} elements",
                n
            ))),
        }
    }

    pub fn read_encapsulation(&mut self) -> Result<Encapsulation> {
        let size = self.read_i32()?;
        if size < Encapsulation::HEADER_SIZE as i32 {
            return Err(ProtocolError::InvalidEncapsulation(format!(
                "size {} is smaller than the encapsulation header",
                size
            )));
        }
        let major = self.read_u8()?;
        let minor = self.read_u8()?;
        let data = self.read_bytes(size as usize - Encapsulation::HEADER_SIZE)?;
        Ok(Encapsulation {
            encoding: EncodingVersion::new(major, minor),
            data,
        })
    }

    /// Fail if anything is left over after a complete message body.
    pub fn expect_end(&self) -> Result<()> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}
