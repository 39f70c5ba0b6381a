//! Client buffer resolution over the local resolver socket.
//!
//! The resolver daemon knows how to find the process that owns a client
//! buffer. One request per connection:
//!
//! ```text
//! request:  "<addr:%08x> <sig byte 0 %02x>...<sig byte 7 %02x>"
//! reply:    native long (owner pid) + one fd in SCM_RIGHTS
//! ```
//!
//! Only the low 32 bits of the handle are sent. The signature bytes are sent
//! in memory order, i.e. little-endian.

use std::fs::File;
use std::io::{IoSliceMut, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::raw::c_long;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::sys::socket::{self, ControlMessageOwned, MsgFlags};
use tracing::{debug, trace};

use crate::application::shm_cache::{MappingResolver, ResolveError, SharedMapping};
use crate::infrastructure::mmap::MappedRegion;

/// Formats the resolver request for a handle and signature.
pub fn resolver_request(address: u64, signature: u64) -> String {
    let mut request = format!("{:08x} ", address & 0xffff_ffff);
    for byte in signature.to_le_bytes() {
        request.push_str(&format!("{byte:02x}"));
    }
    request
}

/// A client buffer mapped into this process.
pub struct ClientBuffer {
    region: MappedRegion,
}

impl SharedMapping for ClientBuffer {
    fn signature(&self) -> Option<u64> {
        self.region.read_u64(0)
    }

    fn len(&self) -> usize {
        self.region.len()
    }

    fn write_frame(&mut self, pixels: &[u8]) -> Result<(), ResolveError> {
        self.region.write_at_start(pixels).map_err(|_| ResolveError::Length {
            frame: pixels.len(),
            mapping: self.region.len(),
        })?;
        self.region.sync().map_err(ResolveError::Sync)
    }
}

/// Resolves buffers through the daemon listening on a unix socket.
#[derive(Debug, Clone)]
pub struct SocketResolver {
    socket_path: PathBuf,
}

impl SocketResolver {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl MappingResolver for SocketResolver {
    type Mapping = ClientBuffer;

    fn resolve(&mut self, address: u64, signature: u64, length: usize) -> Result<ClientBuffer, ResolveError> {
        let mut stream = UnixStream::connect(&self.socket_path).map_err(|source| ResolveError::Connect {
            path: self.socket_path.clone(),
            source,
        })?;

        let request = resolver_request(address, signature);
        trace!("resolver request: {request}");
        stream.write_all(request.as_bytes()).map_err(ResolveError::Send)?;

        let (pid, fd) = receive_pid_fd(&stream)?;
        debug!("resolver: buffer {address:#x} owned by pid {pid}");

        let region =
            MappedRegion::map(File::from(fd), length).map_err(|source| ResolveError::Map { length, source })?;
        Ok(ClientBuffer { region })
    }
}

/// Reads the owner pid and the passed file descriptor.
fn receive_pid_fd(stream: &UnixStream) -> Result<(c_long, OwnedFd), ResolveError> {
    let mut pid = [0u8; std::mem::size_of::<c_long>()];
    let mut iovs = [IoSliceMut::new(&mut pid)];
    let mut cmsg = nix::cmsg_space!([RawFd; 1]);

    let resp = socket::recvmsg::<socket::UnixAddr>(stream.as_raw_fd(), &mut iovs, Some(&mut cmsg), MsgFlags::empty())
        .map_err(|e| ResolveError::Receive(e.into()))?;
    let mut received = None;
    for msg in resp.cmsgs().map_err(|e| ResolveError::Receive(e.into()))? {
        if let ControlMessageOwned::ScmRights(fds) = msg {
            for fd in fds {
                // SAFETY: the kernel just installed fd in our table and it is
                // recorded nowhere else, so wrapping it transfers ownership.
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                // Extra descriptors are closed as `owned` drops.
                received.get_or_insert(owned);
            }
        }
    }
    let fd = received.ok_or(ResolveError::NoDescriptor)?;
    Ok((c_long::from_ne_bytes(pid), fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{sendmsg, ControlMessage};
    use std::io::{IoSlice, Read};
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn test_request_format_matches_resolver() {
        let request = resolver_request(0x7f12_3456_789a, 0x0807_0605_0403_0201);

        assert_eq!(request, "3456789a 0102030405060708");
    }

    #[test]
    fn test_request_pads_short_address() {
        assert_eq!(resolver_request(0x1f, 0), "0000001f 0000000000000000");
    }

    /// Serves one request with a file holding `signature` at offset 0.
    fn spawn_daemon(dir: &Path, signature: u64, len: u64) -> (PathBuf, thread::JoinHandle<String>) {
        let path = dir.join("socket");
        let listener = UnixListener::bind(&path).unwrap();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; 25];
            conn.read_exact(&mut request).unwrap();

            let mut file = tempfile::tempfile().unwrap();
            file.set_len(len).unwrap();
            file.write_all(&signature.to_le_bytes()).unwrap();

            let pid = (4242 as c_long).to_ne_bytes();
            let fds = [file.as_raw_fd()];
            sendmsg::<()>(
                conn.as_raw_fd(),
                &[IoSlice::new(&pid)],
                &[ControlMessage::ScmRights(&fds)],
                MsgFlags::empty(),
                None,
            )
            .unwrap();
            String::from_utf8(request.to_vec()).unwrap()
        });
        (path, handle)
    }

    #[test]
    fn test_resolve_maps_passed_descriptor() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let (path, daemon) = spawn_daemon(dir.path(), 0xABCD, 64);
        let mut resolver = SocketResolver::new(&path);

        // Act
        let mut buffer = resolver.resolve(0x1000, 0xABCD, 64).unwrap();
        buffer.write_frame(&[0xEE; 64]).unwrap();

        // Assert
        assert_eq!(daemon.join().unwrap(), "00001000 cdab000000000000");
        assert_eq!(buffer.len(), 64);
        assert_eq!(buffer.signature(), Some(0xEEEE_EEEE_EEEE_EEEE));
    }

    #[test]
    fn test_fresh_mapping_exposes_producer_signature() {
        let dir = tempfile::tempdir().unwrap();
        let (path, daemon) = spawn_daemon(dir.path(), 0x1122_3344, 32);
        let mut resolver = SocketResolver::new(&path);

        let buffer = resolver.resolve(0x2000, 0x1122_3344, 32).unwrap();
        daemon.join().unwrap();

        assert_eq!(buffer.signature(), Some(0x1122_3344));
    }

    #[test]
    fn test_missing_daemon_is_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut resolver = SocketResolver::new(dir.path().join("absent"));

        let result = resolver.resolve(0x1000, 1, 64);

        assert!(matches!(result, Err(ResolveError::Connect { .. })));
    }

    #[test]
    fn test_reply_without_descriptor_is_rejected() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        let listener = UnixListener::bind(&path).unwrap();
        let daemon = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; 25];
            conn.read_exact(&mut request).unwrap();
            conn.write_all(&(1 as c_long).to_ne_bytes()).unwrap();
        });

        // Act
        let result = SocketResolver::new(&path).resolve(0x1000, 1, 64);
        daemon.join().unwrap();

        // Assert
        assert!(matches!(result, Err(ResolveError::NoDescriptor)));
    }
}
