//! Reassembly of replies that span several datagrams.
//!
//! Fragments may arrive in any order. Nothing is decoded until every fragment of the group is in,
//! since compression covers the whole reply rather than individual datagrams.

use super::packet::{classify, Datagram, Decompressed, FragmentHeader, HEADER};
use crate::{
    errors::{Error, Result},
    protocols::helpers::{checksum, decompress, MAX_DECOMPRESSED_SIZE},
    transport::Transport,
};

use bytes::{BufMut, BytesMut};
use tracing::{debug, error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    AwaitingFirst,
    AwaitingMore,
    Complete,
    Aborted,
}

#[derive(Debug)]
pub struct Reassembler {
    state: State,
    id: u32,
    compressed: bool,
    decompressed: Option<Decompressed>,
    fragments: Vec<Option<Vec<u8>>>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self {
            state: State::AwaitingFirst,
            id: 0,
            compressed: false,
            decompressed: None,
            fragments: Vec::new(),
        }
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    pub fn received(&self) -> usize {
        self.fragments.iter().filter(|f| f.is_some()).count()
    }

    /// Moves to `Aborted` and returns the error describing why.
    pub fn abort(&mut self, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        debug!(
            "Aborting split reply {:#x} after {}/{} fragments: {}",
            self.id,
            self.received(),
            self.fragments.len(),
            reason
        );
        self.state = State::Aborted;
        Error::ReassemblyAborted(reason)
    }

    /// Stores one fragment. Returns whether the group is now complete.
    pub fn push(&mut self, header: FragmentHeader, payload: &[u8]) -> Result<bool> {
        match self.state {
            State::AwaitingFirst => {
                if header.total == 0 {
                    return Err(self.abort("fragment count is zero"));
                }
                self.id = header.id;
                self.compressed = header.compressed;
                self.fragments = vec![None; usize::from(header.total)];
                self.state = State::AwaitingMore;
            }
            State::AwaitingMore => {
                if header.id != self.id || usize::from(header.total) != self.fragments.len() {
                    return Err(self.abort(format!(
                        "fragment {:#x} ({} total) does not belong to {:#x} ({} total)",
                        header.id,
                        header.total,
                        self.id,
                        self.fragments.len()
                    )));
                }
            }
            State::Complete | State::Aborted => {
                return Err(self.abort("fragment received after the group was closed"));
            }
        }

        let index = usize::from(header.index);
        if index >= self.fragments.len() {
            return Err(self.abort(format!(
                "fragment index {} out of range {}",
                index,
                self.fragments.len()
            )));
        }

        if let Some(d) = header.decompressed {
            self.decompressed = Some(d);
        }

        let mut content = payload;
        // The first fragment repeats the single-packet marker; for compressed groups it is
        // inside the compressed stream and stripped after inflating.
        if index == 0 && !self.compressed {
            content = content.get(HEADER.len()..).unwrap_or(&[]);
        }
        let mut content = content.to_vec();
        if !self.compressed {
            terminate(&mut content);
        }

        debug!(
            "Split reply {:#x}: fragment {}/{} ({} bytes, declared {})",
            self.id,
            index + 1,
            self.fragments.len(),
            content.len(),
            header.fragment_size
        );
        self.fragments[index] = Some(content);

        if self.fragments.iter().all(Option::is_some) {
            self.state = State::Complete;
        }

        Ok(self.is_complete())
    }

    /// Joins the fragments in index order, inflating and verifying compressed groups.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(self.abort("group is incomplete"));
        }

        let mut joined = BytesMut::new();
        for fragment in self.fragments.iter().flatten() {
            joined.put_slice(fragment);
        }

        if !self.compressed {
            return Ok(joined.to_vec());
        }

        let d = match self.decompressed {
            Some(d) => d,
            None => return Err(self.abort("compressed group without size and checksum")),
        };

        let expected = d.size as usize;
        if expected > MAX_DECOMPRESSED_SIZE {
            return Err(self.abort(format!(
                "declared decompressed size {} exceeds {}",
                expected, MAX_DECOMPRESSED_SIZE
            )));
        }
        let data = decompress(&joined, expected)?;
        if data.len() != expected {
            error!(
                "Split reply {:#x}: decompressed to {} bytes, expected {}",
                self.id,
                data.len(),
                expected
            );
            return Err(Error::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        let actual = checksum(&data);
        if actual != d.crc32 {
            error!(
                "Split reply {:#x}: CRC32 {:#010x}, expected {:#010x}",
                self.id, actual, d.crc32
            );
            return Err(Error::ChecksumMismatch {
                expected: d.crc32,
                actual,
            });
        }

        Ok(data.get(HEADER.len()..).unwrap_or(&[]).to_vec())
    }
}

/// Some servers cut the last value short. Make sure a fragment never ends mid-string.
fn terminate(content: &mut [u8]) {
    if let Some(last) = content.last_mut() {
        if *last != 0 {
            *last = 0;
        }
    }
}

/// Collects a full split reply. `first` is the body of the split datagram already received.
pub fn collect(transport: &mut dyn Transport, first: &[u8]) -> Result<Vec<u8>> {
    let mut reassembler = Reassembler::new();

    let (header, payload) = FragmentHeader::parse(first)?;
    let mut complete = reassembler.push(header, payload)?;

    while !complete {
        let packet = transport.recv()?;
        let body = match classify(&packet.data) {
            Ok(Datagram::Split(body)) => body,
            Ok(Datagram::Single(_)) => {
                return Err(reassembler.abort("non-split datagram inside a split reply"))
            }
            Err(_) => return Err(reassembler.abort("short datagram")),
        };
        let (header, payload) = match FragmentHeader::parse(body) {
            Ok(v) => v,
            Err(_) => return Err(reassembler.abort("truncated fragment header")),
        };
        complete = reassembler.push(header, payload)?;
    }

    reassembler.finish()
}
