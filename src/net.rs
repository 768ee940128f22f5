use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    os::fd::{AsRawFd, RawFd},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use endian_codec::{DecodeBE, EncodeBE};
use socket2::{Domain, Socket, Type};

/// Reliable, ordered byte stream a device session runs over.
///
/// `send` must write the whole buffer as one unit with respect to other
/// `send` calls, since several submitters may send concurrently. `recv` fills
/// the whole buffer or fails.
pub trait Transport: Send + Sync {
    fn send(&self, data: &[u8]) -> io::Result<()>;
    fn recv(&self, data: &mut [u8]) -> io::Result<()>;

    fn send_encoded<E: EncodeBE>(&self, data: &E) -> io::Result<()>
    where
        Self: Sized,
    {
        let mut buffer = vec![0; E::PACKED_LEN];

        data.encode_as_be_bytes(&mut buffer);

        self.send(&buffer)
    }

    fn recv_encoded<D: DecodeBE>(&self) -> io::Result<D>
    where
        Self: Sized,
    {
        let mut buffer = vec![0; D::PACKED_LEN];

        self.recv(&mut buffer)?;

        Ok(D::decode_from_be_bytes(&buffer))
    }
}

/// A TCP socket wrapper providing helper methods for common USB/IP network
/// operations
#[derive(Debug)]
pub struct UsbIpSocket {
    inner: Socket,
    send_lock: Mutex<()>,
}

impl UsbIpSocket {
    pub const DEFAULT_PORT: u16 = 3240;

    pub fn connect_host_and_port(host: &str, port: u16) -> io::Result<Self> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Self::connect(SocketAddr::new(ip, port));
        }

        let mut last_error = None;

        for addr in (host, port).to_socket_addrs()? {
            match Self::connect(addr) {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    tracing::debug!(%addr, "connect failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "No addresses found")))
    }

    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;

        socket.set_tcp_nodelay(true)?;
        socket.set_keepalive(true)?;

        socket.connect(&addr.into())?;

        tracing::debug!(%addr, "connected");

        Ok(Self {
            inner: socket,
            send_lock: Mutex::new(()),
        })
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.inner.shutdown(std::net::Shutdown::Both)
    }
}

impl Transport for UsbIpSocket {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let _guard = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);

        (&self.inner).write_all(data)
    }

    fn recv(&self, data: &mut [u8]) -> io::Result<()> {
        (&self.inner).read_exact(data)
    }
}

impl AsRawFd for UsbIpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// In-memory transport. Everything sent is recorded per `send` call,
/// `recv` is served from bytes queued with [`MemoryTransport::push_inbound`].
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    inbound: Mutex<VecDeque<u8>>,
    fail_sends: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        Self::lock(&self.inbound).extend(bytes);
    }

    /// Returns and forgets everything sent so far, one entry per `send`
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *Self::lock(&self.sent))
    }

    /// Makes every following `send` fail with a broken pipe
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        Self::lock(&self.sent).push(data.to_vec());

        Ok(())
    }

    fn recv(&self, data: &mut [u8]) -> io::Result<()> {
        let mut inbound = Self::lock(&self.inbound);

        if inbound.len() < data.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        let len = data.len();
        for (dst, src) in data.iter_mut().zip(inbound.drain(..len)) {
            *dst = src;
        }

        Ok(())
    }
}
