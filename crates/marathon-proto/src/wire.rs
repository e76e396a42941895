//! Payload field primitives.
//!
//! Variable-length fields carry a big-endian `u32` length prefix; optional
//! fields a 1-byte presence flag. Integers are big-endian, signed where the
//! field semantics allow negatives.

use uuid::Uuid;

use crate::{AUTH_TOKEN_SIZE, ProtoError, Result};

/// Sequential payload writer.
#[derive(Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_id(&mut self, id: Uuid) {
        self.buf.extend_from_slice(id.as_bytes());
    }

    pub fn put_token(&mut self, token: &[u8; AUTH_TOKEN_SIZE]) {
        self.buf.extend_from_slice(token);
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    pub fn put_opt_str(&mut self, s: Option<&str>) {
        match s {
            Some(s) => {
                self.put_u8(1);
                self.put_str(s);
            }
            None => self.put_u8(0),
        }
    }

    pub fn put_opt_u32(&mut self, v: Option<u32>) {
        match v {
            Some(v) => {
                self.put_u8(1);
                self.put_u32(v);
            }
            None => self.put_u8(0),
        }
    }
}

/// Sequential payload reader over a borrowed byte slice.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos.saturating_add(n))
            .ok_or(ProtoError::InvalidPayload(what))?;
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8> {
        Ok(self.take(1, what)?.first().copied().unwrap_or_default())
    }

    pub fn bool(&mut self, what: &'static str) -> Result<bool> {
        Ok(self.u8(what)? != 0)
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32> {
        let bytes = self.take(4, what)?;
        bytes
            .try_into()
            .map(u32::from_be_bytes)
            .map_err(|_| ProtoError::InvalidPayload(what))
    }

    pub fn i32(&mut self, what: &'static str) -> Result<i32> {
        let bytes = self.take(4, what)?;
        bytes
            .try_into()
            .map(i32::from_be_bytes)
            .map_err(|_| ProtoError::InvalidPayload(what))
    }

    pub fn i64(&mut self, what: &'static str) -> Result<i64> {
        let bytes = self.take(8, what)?;
        bytes
            .try_into()
            .map(i64::from_be_bytes)
            .map_err(|_| ProtoError::InvalidPayload(what))
    }

    pub fn f64(&mut self, what: &'static str) -> Result<f64> {
        let bytes = self.take(8, what)?;
        bytes
            .try_into()
            .map(f64::from_be_bytes)
            .map_err(|_| ProtoError::InvalidPayload(what))
    }

    pub fn id(&mut self, what: &'static str) -> Result<Uuid> {
        let bytes: [u8; 16] = self
            .take(16, what)?
            .try_into()
            .map_err(|_| ProtoError::InvalidPayload(what))?;
        Ok(Uuid::from_bytes(bytes))
    }

    pub fn token(&mut self, what: &'static str) -> Result<[u8; AUTH_TOKEN_SIZE]> {
        self.take(AUTH_TOKEN_SIZE, what)?
            .try_into()
            .map_err(|_| ProtoError::InvalidPayload(what))
    }

    pub fn bytes(&mut self, what: &'static str) -> Result<Vec<u8>> {
        let len = self.u32(what)? as usize;
        Ok(self.take(len, what)?.to_vec())
    }

    pub fn str(&mut self, what: &'static str) -> Result<String> {
        let bytes = self.bytes(what)?;
        String::from_utf8(bytes).map_err(|_| ProtoError::InvalidPayload(what))
    }

    pub fn opt_str(&mut self, what: &'static str) -> Result<Option<String>> {
        if self.bool(what)? {
            Ok(Some(self.str(what)?))
        } else {
            Ok(None)
        }
    }

    pub fn opt_u32(&mut self, what: &'static str) -> Result<Option<u32>> {
        if self.bool(what)? {
            Ok(Some(self.u32(what)?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        let mut w = Writer::new();
        w.put_u8(7);
        w.put_bool(true);
        w.put_u32(0xDEAD_BEEF);
        w.put_i32(-5);
        w.put_i64(-1_000_000_000_000);
        w.put_f64(0.25);
        let buf = w.into_inner();

        let mut r = Reader::new(&buf);
        assert_eq!(r.u8("a").unwrap(), 7);
        assert!(r.bool("b").unwrap());
        assert_eq!(r.u32("c").unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.i32("d").unwrap(), -5);
        assert_eq!(r.i64("e").unwrap(), -1_000_000_000_000);
        assert_eq!(r.f64("f").unwrap(), 0.25);
    }

    #[test]
    fn string_and_optional_roundtrip() {
        let mut w = Writer::new();
        w.put_str("hello");
        w.put_opt_str(Some("there"));
        w.put_opt_str(None);
        w.put_opt_u32(Some(3));
        w.put_opt_u32(None);
        let buf = w.into_inner();

        let mut r = Reader::new(&buf);
        assert_eq!(r.str("a").unwrap(), "hello");
        assert_eq!(r.opt_str("b").unwrap().as_deref(), Some("there"));
        assert_eq!(r.opt_str("c").unwrap(), None);
        assert_eq!(r.opt_u32("d").unwrap(), Some(3));
        assert_eq!(r.opt_u32("e").unwrap(), None);
    }

    #[test]
    fn absent_optional_emits_only_the_tag() {
        let mut w = Writer::new();
        w.put_opt_str(None);
        assert_eq!(w.into_inner(), vec![0]);
    }

    #[test]
    fn id_roundtrip() {
        let id = Uuid::new_v4();
        let mut w = Writer::new();
        w.put_id(id);
        let buf = w.into_inner();
        assert_eq!(buf.len(), 16);
        assert_eq!(Reader::new(&buf).id("id").unwrap(), id);
    }

    #[test]
    fn truncated_read_fails() {
        let mut w = Writer::new();
        w.put_u32(100);
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        // Length prefix claims 100 bytes but none follow.
        assert!(r.bytes("data").is_err());
    }

    #[test]
    fn invalid_utf8_fails() {
        let mut w = Writer::new();
        w.put_bytes(&[0xFF, 0xFE]);
        let buf = w.into_inner();
        assert!(Reader::new(&buf).str("s").is_err());
    }
}
