//! Two-slot cache of client shared-memory mappings.
//!
//! # How frames reach the client (for beginners)
//!
//! The client does not receive pixels over the WebSocket. It allocates a
//! shared-memory buffer, writes a random 64-bit *signature* into its first
//! eight bytes, and sends the buffer's opaque handle (its address on the
//! client side) plus the signature with each screen request. The server asks
//! an external resolver to turn the handle into a file descriptor, maps it,
//! and copies each captured frame into it.
//!
//! Resolving is slow, so the two most recently resolved mappings are kept.
//! The client double-buffers, so two slots are enough.
//!
//! # When is a cached mapping still valid?
//!
//! The client may free a buffer and allocate a new one at the same address.
//! Before every use the signature word is read back *live* from the mapping and
//! compared to the one the client declared. On mismatch the mapping is dropped
//! and resolved again. A freshly resolved mapping is checked the same way: the
//! producer may have rotated buffers between request and resolution, so the
//! resolution is retried up to `attempts` times in total.
//!
//! # Eviction
//!
//! A handle not present in either slot replaces the slot under a round-robin
//! pointer (not LRU: a hit does not move the pointer).
//!
//! Failures are never fatal. [`ShmCache::lookup`] returns `None` and the
//! caller reports "shm failed" in its reply.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

/// Number of cache slots.
pub const CACHE_SLOTS: usize = 2;

/// Default number of resolutions per lookup.
pub const DEFAULT_ATTEMPTS: u32 = 2;

/// Errors that can occur while resolving a client buffer.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cannot connect to resolver at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot send resolver request: {0}")]
    Send(#[source] io::Error),

    #[error("no response from resolver: {0}")]
    Receive(#[source] io::Error),

    #[error("resolver passed no file descriptor")]
    NoDescriptor,

    #[error("cannot map {length} bytes: {source}")]
    Map {
        length: usize,
        #[source]
        source: io::Error,
    },

    #[error("cannot sync mapping: {0}")]
    Sync(#[source] io::Error),

    #[error("frame of {frame} bytes does not fit a {mapping}-byte mapping")]
    Length { frame: usize, mapping: usize },
}

/// A locally mapped client buffer.
pub trait SharedMapping {
    /// The first eight bytes of the mapping, read now. `None` if the mapping
    /// is shorter than that.
    fn signature(&self) -> Option<u64>;

    /// Mapped length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `pixels` to the start of the mapping and flushes it.
    fn write_frame(&mut self, pixels: &[u8]) -> Result<(), ResolveError>;
}

/// Turns a client buffer handle into a local mapping.
pub trait MappingResolver {
    type Mapping: SharedMapping;

    fn resolve(&mut self, address: u64, signature: u64, length: usize) -> Result<Self::Mapping, ResolveError>;
}

struct Slot<M> {
    address: Option<u64>,
    mapping: Option<M>,
}

impl<M> Slot<M> {
    const fn empty() -> Self {
        Self {
            address: None,
            mapping: None,
        }
    }
}

pub struct ShmCache<R: MappingResolver> {
    resolver: R,
    slots: [Slot<R::Mapping>; CACHE_SLOTS],
    next_entry: usize,
    attempts: u32,
}

impl<R: MappingResolver> ShmCache<R> {
    /// Creates an empty cache. `attempts` is clamped to at least 1.
    pub fn new(resolver: R, attempts: u32) -> Self {
        Self {
            resolver,
            slots: [Slot::empty(), Slot::empty()],
            next_entry: 0,
            attempts: attempts.max(1),
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Returns a mapping for `address` whose live signature is `signature`,
    /// resolving it if needed. `length` is the size to map on resolution.
    pub fn lookup(&mut self, address: u64, signature: u64, length: usize) -> Option<&mut R::Mapping> {
        let index = match self.slots.iter().position(|s| s.address == Some(address)) {
            Some(index) => index,
            None => {
                let index = self.next_entry;
                self.next_entry = (index + 1) % CACHE_SLOTS;
                if let Some(old) = self.slots[index].address {
                    debug!("evicting shm {old:#x} from slot {index}");
                }
                self.slots[index] = Slot::empty();
                index
            }
        };

        let mut resolved = 0;
        loop {
            let slot = &mut self.slots[index];
            if let Some(mapping) = &slot.mapping {
                if mapping.signature() == Some(signature) {
                    break;
                }
                debug!("invalid signature for shm {address:#x}, fetching a new mapping");
                slot.mapping = None;
            }
            if resolved == self.attempts {
                warn!("cannot find shm {address:#x} after {resolved} resolution(s)");
                return None;
            }
            resolved += 1;
            match self.resolver.resolve(address, signature, length) {
                Ok(mapping) => {
                    debug!("shm {address:#x}: mapped {} bytes in slot {index}", mapping.len());
                    slot.address = Some(address);
                    slot.mapping = Some(mapping);
                }
                Err(e) => {
                    warn!("cannot resolve shm {address:#x}: {e}");
                    return None;
                }
            }
        }
        self.slots[index].mapping.as_mut()
    }

    /// Drops both mappings.
    pub fn clear(&mut self) {
        self.slots = [Slot::empty(), Slot::empty()];
        self.next_entry = 0;
    }

    /// Number of slots currently holding a mapping.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.mapping.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
