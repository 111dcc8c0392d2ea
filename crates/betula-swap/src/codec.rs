//! Byte streams for object serialization.
//!
//! `SaveStream` and `LoadStream` carry the serialization context that the
//! swap space threads through every object save/load: a little-endian
//! framing layer for fixed-width fields, bincode encoding for serde
//! payloads, and a tally of every handle written or resolved. The tally is
//! what makes reference counting across the serialization boundary
//! checkable: after a load it must match the counts recorded for the
//! on-disk image.

use std::collections::HashMap;
use std::io::ErrorKind;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use betula_common::{ObjectId, Result};

fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
}

/// Output stream for serializing one object.
///
/// Collects bytes and the multiset of outbound object references written
/// through it.
pub struct SaveStream {
    buf: Vec<u8>,
    refs: HashMap<ObjectId, u64>,
}

impl SaveStream {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::new(),
            refs: HashMap::new(),
        }
    }

    /// Appends a little-endian u64.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a single byte.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Appends a serde payload encoded with bincode.
    pub fn put<S: Serialize + ?Sized>(&mut self, value: &S) -> Result<()> {
        bincode_options().serialize_into(&mut self.buf, value)?;
        Ok(())
    }

    /// Records one outbound reference to the given object.
    pub(crate) fn note_ref(&mut self, id: ObjectId) {
        *self.refs.entry(id).or_insert(0) += 1;
    }

    pub(crate) fn finish(self) -> (Vec<u8>, HashMap<ObjectId, u64>) {
        (self.buf, self.refs)
    }

    #[cfg(test)]
    pub(crate) fn refs(&self) -> &HashMap<ObjectId, u64> {
        &self.refs
    }
}

/// Input stream for deserializing one object.
///
/// Mirrors [`SaveStream`]: fixed-width fields, bincode payloads, and a
/// tally of every handle resolved while reading.
pub struct LoadStream<'a> {
    data: &'a [u8],
    pos: usize,
    pub(crate) space: Option<crate::space::WeakSpace>,
    refs: HashMap<ObjectId, u64>,
}

impl<'a> LoadStream<'a> {
    pub(crate) fn new(data: &'a [u8], space: crate::space::WeakSpace) -> Self {
        Self {
            data,
            pos: 0,
            space: Some(space),
            refs: HashMap::new(),
        }
    }

    /// A stream with no swap space attached; resolving handles through it
    /// is a contract violation. Used for self-contained blobs such as the
    /// checkpoint directory.
    pub(crate) fn detached(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            space: None,
            refs: HashMap::new(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into());
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Reads a little-endian u64.
    pub fn get_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    /// Reads a single byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a bincode-encoded serde payload.
    pub fn get<D: DeserializeOwned>(&mut self) -> Result<D> {
        let mut slice = &self.data[self.pos..];
        let value = bincode_options().deserialize_from(&mut slice)?;
        self.pos = self.data.len() - slice.len();
        Ok(value)
    }

    /// Records one inbound reference to the given object.
    pub(crate) fn note_ref(&mut self, id: ObjectId) {
        *self.refs.entry(id).or_insert(0) += 1;
    }

    /// True when every byte of the blob has been consumed.
    pub fn finished(&self) -> bool {
        self.pos == self.data.len()
    }

    pub(crate) fn refs(&self) -> &HashMap<ObjectId, u64> {
        &self.refs
    }
}
