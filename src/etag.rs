//! Content hashing.
//!
//! Provides the storage etag the backend reports as `hash`, plus the per-block
//! checksum verified against every block upload response.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Etag block size, fixed by the storage protocol
pub const ETAG_BLOCK_SIZE: usize = 1 << 22;

const SINGLE_BLOCK_PREFIX: u8 = 0x16;
const MULTI_BLOCK_PREFIX: u8 = 0x96;

/// Incremental etag calculator fed with arbitrary-sized writes
#[derive(Default)]
pub struct Etag {
    block_digests: Vec<[u8; 20]>,
    current: Sha1,
    current_len: usize,
}

impl Etag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = ETAG_BLOCK_SIZE - self.current_len;
            let take = room.min(data.len());
            self.current.update(&data[..take]);
            self.current_len += take;
            data = &data[take..];
            if self.current_len == ETAG_BLOCK_SIZE {
                self.finish_block();
            }
        }
    }

    fn finish_block(&mut self) {
        let digest = std::mem::take(&mut self.current).finalize();
        self.block_digests.push(digest.into());
        self.current_len = 0;
    }

    pub fn finalize(mut self) -> String {
        if self.current_len > 0 || self.block_digests.is_empty() {
            self.finish_block();
        }

        let mut out = Vec::with_capacity(21);
        if self.block_digests.len() == 1 {
            out.push(SINGLE_BLOCK_PREFIX);
            out.extend_from_slice(&self.block_digests[0]);
        } else {
            let mut hasher = Sha1::new();
            for digest in &self.block_digests {
                hasher.update(digest);
            }
            out.push(MULTI_BLOCK_PREFIX);
            out.extend_from_slice(&hasher.finalize());
        }
        URL_SAFE.encode(out)
    }
}

pub fn etag_of_bytes(data: &[u8]) -> String {
    let mut etag = Etag::new();
    etag.update(data);
    etag.finalize()
}

pub fn etag_of_reader(mut reader: impl Read) -> io::Result<String> {
    let mut etag = Etag::new();
    let mut buffer = vec![0u8; 1 << 16];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        etag.update(&buffer[..n]);
    }
    Ok(etag.finalize())
}

pub fn etag_of_file(path: impl AsRef<Path>) -> io::Result<String> {
    etag_of_reader(File::open(path)?)
}

/// URL-safe base64 SHA-1 of one upload block
pub fn block_checksum(block: &[u8]) -> String {
    URL_SAFE.encode(Sha1::digest(block))
}
