use std::sync::Arc;

use log::debug;

use crate::network::messages::DownloadGameStateChunk;

/// Octets per blob-stream chunk. A chunk datagram stays well under the 1200-octet datagram
/// budget with the framing and chunk header in front.
pub(crate) const BLOB_CHUNK_SIZE: usize = 1024;

/// How many chunk datagrams the server emits per inbound progress report.
pub(crate) const BLOB_CHUNK_BURST: usize = 4;

/// Sending half of a blob stream: one per downloading client. The blob itself is shared with
/// the game's latest snapshot and must stay unchanged until the last chunk is acknowledged.
#[derive(Debug, Clone)]
pub(crate) struct BlobStreamOut {
    blob: Arc<[u8]>,
    chunk_count: u32,
    waiting_for_chunk_id: u32,
}

impl BlobStreamOut {
    pub(crate) fn new(blob: Arc<[u8]>) -> Self {
        let chunk_count = blob.len().div_ceil(BLOB_CHUNK_SIZE) as u32;
        Self {
            blob,
            chunk_count,
            waiting_for_chunk_id: 0,
        }
    }

    pub(crate) fn total_octet_count(&self) -> u32 {
        self.blob.len() as u32
    }

    pub(crate) fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Advances transfer progress from a client status report. Progress never moves backwards;
    /// a repeated or stale report just re-triggers the same burst.
    pub(crate) fn receive_status(&mut self, waiting_for_chunk_id: u32) {
        if waiting_for_chunk_id > self.waiting_for_chunk_id {
            self.waiting_for_chunk_id = waiting_for_chunk_id.min(self.chunk_count);
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.waiting_for_chunk_id >= self.chunk_count
    }

    /// The next burst of chunks to put on the wire, starting at the client's reported
    /// progress.
    pub(crate) fn burst(&self, channel: u8) -> Vec<DownloadGameStateChunk> {
        let mut chunks = Vec::new();
        for offset in 0..BLOB_CHUNK_BURST as u32 {
            let chunk_id = self.waiting_for_chunk_id + offset;
            if chunk_id >= self.chunk_count {
                break;
            }
            let start = chunk_id as usize * BLOB_CHUNK_SIZE;
            let end = (start + BLOB_CHUNK_SIZE).min(self.blob.len());
            chunks.push(DownloadGameStateChunk {
                channel,
                chunk_id,
                payload: self.blob[start..end].to_vec(),
            });
        }
        chunks
    }
}

/// Receiving half of a blob stream. Lives on the client; the server crate carries it so both
/// ends of the sub-protocol are specified in one place, and the download tests drive it.
#[derive(Debug, Clone)]
pub struct BlobStreamIn {
    octets: Vec<u8>,
    chunk_count: u32,
    received: Vec<bool>,
}

impl BlobStreamIn {
    /// Prepares to receive a blob of `total_octet_count` octets, announced by the download
    /// response.
    pub fn new(total_octet_count: u32) -> Self {
        let chunk_count = (total_octet_count as usize).div_ceil(BLOB_CHUNK_SIZE) as u32;
        Self {
            octets: vec![0; total_octet_count as usize],
            chunk_count,
            received: vec![false; chunk_count as usize],
        }
    }

    /// Accepts one chunk. Chunks may arrive in any order; duplicates and chunks that do not
    /// fit the announced blob are ignored.
    pub fn receive_chunk(&mut self, chunk_id: u32, payload: &[u8]) {
        if chunk_id >= self.chunk_count {
            debug!("ignoring chunk {} past the announced blob", chunk_id);
            return;
        }
        let start = chunk_id as usize * BLOB_CHUNK_SIZE;
        let expected_len = (self.octets.len() - start).min(BLOB_CHUNK_SIZE);
        if payload.len() != expected_len {
            debug!(
                "ignoring chunk {} with {} octets, expected {}",
                chunk_id,
                payload.len(),
                expected_len
            );
            return;
        }
        self.octets[start..start + expected_len].copy_from_slice(payload);
        self.received[chunk_id as usize] = true;
    }

    /// The lowest chunk id not received yet; equals the chunk count when the transfer is
    /// complete. This is what goes into the next status report.
    pub fn waiting_for_chunk_id(&self) -> u32 {
        self.received
            .iter()
            .position(|received| !received)
            .map(|position| position as u32)
            .unwrap_or(self.chunk_count)
    }

    /// True once every chunk has arrived.
    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|received| *received)
    }

    /// The assembled blob, available once the transfer is complete.
    pub fn blob(&self) -> Option<&[u8]> {
        if self.is_complete() {
            Some(&self.octets)
        } else {
            None
        }
    }
}

// #########
// # TESTS #
// #########
