//! Userspace TCP/IP stack bound to the tunnel's inner addresses.
//!
//! Keeping the whole stack in process is what lets the client run
//! unprivileged: no TUN device, no routing changes, no root. The stack has
//! two faces. The [`PacketFace`] is a frame-level duplex the tunnel session
//! pumps: outbound IP packets the stack generates, inbound IP packets
//! received from the wire. The [`SocketFace`] dials TCP and UDP connections
//! whose source is one of the inner addresses; those connections are plain
//! `AsyncRead + AsyncWrite` values backed by bounded channels.
//!
//! One dataplane task owns the smoltcp interface, its sockets, and the
//! in-memory device, and moves bytes between sockets and per-connection
//! channels. The task lives until every face and connection is gone, so
//! user connections survive tunnel reconnects.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::PollSender;
use tracing::{debug, trace};

use crate::error::TunnelError;

const MIN_MTU: usize = 576;
const MAX_MTU: usize = 65_535;
const TCP_BUFFER: usize = 256 * 1024;
const UDP_BUFFER: usize = 64 * 1024;
const UDP_PACKET_META: usize = 16;
const PACKET_CHANNEL: usize = 512;
const CONN_CHANNEL: usize = 64;
const INBOUND_QUEUE_MAX: usize = 1024;
const COPY_CHUNK: usize = 4096;
const EPHEMERAL_START: u16 = 40_000;
const EPHEMERAL_END: u16 = 65_000;
const IDLE_POLL_MAX: Duration = Duration::from_secs(1);

fn smoltcp_now() -> SmolInstant {
    let millis = std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    SmolInstant::from_millis(millis)
}

fn to_smol(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(a) => IpAddress::Ipv4(a),
        IpAddr::V6(a) => IpAddress::Ipv6(a),
    }
}

/// In-memory IP device: two frame queues, no link layer.
struct VirtDevice {
    inbound: VecDeque<Bytes>,
    outbound: VecDeque<Vec<u8>>,
    caps: DeviceCapabilities,
}

impl VirtDevice {
    fn new(mtu: usize) -> Self {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = mtu;
        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            caps,
        }
    }
}

struct IpRxToken(Bytes);

impl RxToken for IpRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

struct IpTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl<'a> TxToken for IpTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let r = f(&mut buf);
        self.0.push_back(buf);
        r
    }
}

impl Device for VirtDevice {
    type RxToken<'a> = IpRxToken;
    type TxToken<'a> = IpTxToken<'a>;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.inbound
            .pop_front()
            .map(|frame| (IpRxToken(frame), IpTxToken(&mut self.outbound)))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(IpTxToken(&mut self.outbound))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }
}

enum DialRequest {
    Tcp {
        remote: SocketAddr,
        to_conn: mpsc::Sender<Bytes>,
        from_conn: mpsc::Receiver<Bytes>,
        ready: oneshot::Sender<io::Result<()>>,
    },
    Udp {
        remote: SocketAddr,
        to_conn: mpsc::Sender<Bytes>,
        from_conn: mpsc::Receiver<Bytes>,
        ready: oneshot::Sender<io::Result<()>>,
    },
}

/// Frame-level face of the stack, owned by the tunnel supervisor and lent to
/// each session in turn.
pub struct PacketFace {
    outbound: mpsc::Receiver<Bytes>,
    inbound: mpsc::Sender<Bytes>,
    wake: Arc<Notify>,
}

impl PacketFace {
    /// Next outbound IP packet generated by the stack. Returns `None` once
    /// the stack has shut down.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    /// Inject an inbound IP packet from the wire. Best effort: if the stack
    /// is congested or gone the packet is dropped, exactly as a lossy link
    /// would drop it.
    pub fn write(&self, frame: Bytes) {
        if self.inbound.try_send(frame).is_ok() {
            self.wake.notify_one();
        }
    }
}

/// Connection-dialing face of the stack. Cheap to clone; every proxy
/// frontend and the resolver share one.
#[derive(Clone)]
pub struct SocketFace {
    dials: mpsc::Sender<DialRequest>,
    dns_servers: Arc<[IpAddr]>,
    wake: Arc<Notify>,
}

impl SocketFace {
    /// DNS servers configured for this stack, in query order.
    pub fn dns_servers(&self) -> &[IpAddr] {
        &self.dns_servers
    }

    /// Dial a TCP or UDP connection through the stack. `network` accepts the
    /// usual `tcp`/`tcp4`/`tcp6`/`udp`/`udp4`/`udp6` strings.
    pub async fn dial(&self, network: &str, addr: SocketAddr) -> io::Result<VirtualConn> {
        match network {
            "tcp" | "tcp4" | "tcp6" => self.dial_tcp(addr).await,
            "udp" | "udp4" | "udp6" => self.dial_udp(addr).await,
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network {other:?}"),
            )),
        }
    }

    pub async fn dial_tcp(&self, addr: SocketAddr) -> io::Result<VirtualConn> {
        self.dial_inner(addr, true).await
    }

    pub async fn dial_udp(&self, addr: SocketAddr) -> io::Result<VirtualConn> {
        self.dial_inner(addr, false).await
    }

    async fn dial_inner(&self, addr: SocketAddr, is_tcp: bool) -> io::Result<VirtualConn> {
        let (to_conn_tx, to_conn_rx) = mpsc::channel(CONN_CHANNEL);
        let (from_conn_tx, from_conn_rx) = mpsc::channel(CONN_CHANNEL);
        let (ready_tx, ready_rx) = oneshot::channel();

        let request = if is_tcp {
            DialRequest::Tcp {
                remote: addr,
                to_conn: to_conn_tx,
                from_conn: from_conn_rx,
                ready: ready_tx,
            }
        } else {
            DialRequest::Udp {
                remote: addr,
                to_conn: to_conn_tx,
                from_conn: from_conn_rx,
                ready: ready_tx,
            }
        };

        self.dials
            .send(request)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "virtual stack is gone"))?;
        self.wake.notify_one();

        ready_rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "virtual stack is gone"))??;

        Ok(VirtualConn {
            rx: to_conn_rx,
            tx: PollSender::new(from_conn_tx),
            wake: self.wake.clone(),
            buffered: Bytes::new(),
        })
    }
}

/// A TCP stream or connected UDP socket synthesized by the stack.
///
/// For TCP the byte stream semantics are the usual ones. For UDP every write
/// is one datagram and every read yields one datagram.
pub struct VirtualConn {
    rx: mpsc::Receiver<Bytes>,
    tx: PollSender<Bytes>,
    wake: Arc<Notify>,
    buffered: Bytes,
}

impl AsyncRead for VirtualConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffered.is_empty() {
            let n = self.buffered.len().min(buf.remaining());
            buf.put_slice(&self.buffered[..n]);
            let rest = self.buffered.slice(n..);
            self.buffered = rest;
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.buffered = data.slice(n..);
                }
                // Channel capacity freed; let the dataplane refill it.
                self.wake.notify_one();
                Poll::Ready(Ok(()))
            }
            // Stack side dropped the sender: connection closed.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for VirtualConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let chunk = Bytes::copy_from_slice(buf);
                if self.tx.send_item(chunk).is_err() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "virtual connection closed",
                    )));
                }
                self.wake.notify_one();
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "virtual connection closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        self.wake.notify_one();
        Poll::Ready(Ok(()))
    }
}

struct TcpEntry {
    handle: SocketHandle,
    to_conn: Option<mpsc::Sender<Bytes>>,
    from_conn: mpsc::Receiver<Bytes>,
    ready: Option<oneshot::Sender<io::Result<()>>>,
    tx_pending: Option<Bytes>,
}

struct UdpEntry {
    handle: SocketHandle,
    remote: IpEndpoint,
    to_conn: Option<mpsc::Sender<Bytes>>,
    from_conn: mpsc::Receiver<Bytes>,
}

/// Constructor for the virtual stack. Both faces are created atomically;
/// must be called from within a tokio runtime.
pub struct VirtualStack;

impl VirtualStack {
    pub fn new(
        local_addrs: &[IpAddr],
        dns_servers: Vec<IpAddr>,
        mtu: usize,
    ) -> Result<(PacketFace, SocketFace), TunnelError> {
        if local_addrs.is_empty() {
            return Err(TunnelError::Config(
                "virtual stack needs at least one inner address".into(),
            ));
        }
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(TunnelError::Config(format!(
                "mtu {mtu} outside supported range {MIN_MTU}..={MAX_MTU}"
            )));
        }

        let (packet_tx, packet_rx) = mpsc::channel(PACKET_CHANNEL);
        let (inbound_tx, inbound_rx) = mpsc::channel(PACKET_CHANNEL);
        let (dial_tx, dial_rx) = mpsc::channel(16);
        let wake = Arc::new(Notify::new());

        tokio::spawn(dataplane(
            local_addrs.to_vec(),
            mtu,
            packet_tx,
            inbound_rx,
            dial_rx,
            wake.clone(),
        ));

        Ok((
            PacketFace {
                outbound: packet_rx,
                inbound: inbound_tx,
                wake: wake.clone(),
            },
            SocketFace {
                dials: dial_tx,
                dns_servers: dns_servers.into(),
                wake,
            },
        ))
    }
}

fn alloc_port(next: &mut u16) -> u16 {
    let port = *next;
    *next = if *next >= EPHEMERAL_END {
        EPHEMERAL_START
    } else {
        *next + 1
    };
    port
}

fn local_addr_for(local_addrs: &[IpAddr], remote: &SocketAddr) -> Option<IpAddr> {
    local_addrs
        .iter()
        .copied()
        .find(|a| a.is_ipv4() == remote.is_ipv4())
}

async fn dataplane(
    local_addrs: Vec<IpAddr>,
    mtu: usize,
    packet_tx: mpsc::Sender<Bytes>,
    mut inbound_rx: mpsc::Receiver<Bytes>,
    mut dial_rx: mpsc::Receiver<DialRequest>,
    wake: Arc<Notify>,
) {
    let mut device = VirtDevice::new(mtu);
    let mut iface = Interface::new(IfaceConfig::new(HardwareAddress::Ip), &mut device, smoltcp_now());
    iface.update_ip_addrs(|addrs| {
        for addr in &local_addrs {
            let cidr = match addr {
                IpAddr::V4(v4) => IpCidr::new(IpAddress::Ipv4(*v4), 32),
                IpAddr::V6(v6) => IpCidr::new(IpAddress::Ipv6(*v6), 128),
            };
            let _ = addrs.push(cidr);
        }
    });
    // Next hops are nominal: Medium::Ip has no neighbour resolution, the
    // routes only steer everything toward the device.
    let _ = iface
        .routes_mut()
        .add_default_ipv4_route(Ipv4Addr::new(0, 0, 0, 1));
    let _ = iface
        .routes_mut()
        .add_default_ipv6_route(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));

    let mut sockets = SocketSet::new(vec![]);
    let mut tcp_entries: Vec<TcpEntry> = Vec::new();
    let mut udp_entries: Vec<UdpEntry> = Vec::new();
    let mut next_port = EPHEMERAL_START;

    debug!(addrs = ?local_addrs, mtu, "virtual stack dataplane started");

    loop {
        let now = smoltcp_now();
        let _ = iface.poll(now, &mut device, &mut sockets);

        // Stack-generated frames toward the wire. IP is lossy; congestion
        // or an absent session means the frame vanishes.
        while let Some(frame) = device.outbound.pop_front() {
            if packet_tx.try_send(Bytes::from(frame)).is_err() {
                trace!("outbound frame dropped");
            }
        }

        // Frames injected from the wire.
        loop {
            match inbound_rx.try_recv() {
                Ok(frame) if device.inbound.len() < INBOUND_QUEUE_MAX => {
                    device.inbound.push_back(frame)
                }
                Ok(_) => trace!("inbound frame dropped, queue full"),
                Err(_) => break,
            }
        }

        while let Ok(request) = dial_rx.try_recv() {
            open_socket(
                request,
                &local_addrs,
                &mut iface,
                &mut sockets,
                &mut tcp_entries,
                &mut udp_entries,
                &mut next_port,
            );
        }

        tcp_entries.retain_mut(|entry| {
            let sock = sockets.get_mut::<tcp::Socket>(entry.handle);

            if let Some(ready) = entry.ready.take() {
                if sock.may_send() {
                    let _ = ready.send(Ok(()));
                } else if sock.state() == tcp::State::Closed {
                    let _ = ready.send(Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    )));
                    sockets.remove(entry.handle);
                    return false;
                } else {
                    entry.ready = Some(ready);
                }
            }

            // Socket to connection. Only pull data out when the channel has
            // room, so the receive window applies backpressure end to end.
            if let Some(tx) = &entry.to_conn {
                loop {
                    if !sock.can_recv() {
                        break;
                    }
                    match tx.try_reserve() {
                        Ok(permit) => {
                            let mut chunk = [0u8; COPY_CHUNK];
                            match sock.recv_slice(&mut chunk) {
                                Ok(n) if n > 0 => permit.send(Bytes::copy_from_slice(&chunk[..n])),
                                _ => break,
                            }
                        }
                        Err(TrySendError::Full(())) => break,
                        Err(TrySendError::Closed(())) => {
                            entry.to_conn = None;
                            break;
                        }
                    }
                }
                // Remote finished sending and the buffer is drained: signal
                // EOF by dropping our sender.
                if entry.to_conn.is_some() && !sock.may_recv() && !sock.can_recv() {
                    entry.to_conn = None;
                }
            }

            // Connection to socket, honoring the send window.
            loop {
                if entry.tx_pending.is_none() {
                    match entry.from_conn.try_recv() {
                        Ok(chunk) => entry.tx_pending = Some(chunk),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            sock.close();
                            break;
                        }
                    }
                }
                if !sock.can_send() {
                    break;
                }
                let chunk = entry.tx_pending.take().unwrap();
                match sock.send_slice(&chunk) {
                    Ok(n) if n == chunk.len() => continue,
                    Ok(n) => {
                        entry.tx_pending = Some(chunk.slice(n..));
                        break;
                    }
                    Err(_) => break,
                }
            }

            if !sock.is_open() && entry.ready.is_none() {
                sockets.remove(entry.handle);
                return false;
            }
            true
        });

        udp_entries.retain_mut(|entry| {
            let sock = sockets.get_mut::<udp::Socket>(entry.handle);

            if let Some(tx) = &entry.to_conn {
                while sock.can_recv() {
                    match tx.try_reserve() {
                        Ok(permit) => match sock.recv() {
                            Ok((data, meta)) => {
                                // Connected-socket semantics: datagrams from
                                // other sources are dropped.
                                if meta.endpoint == entry.remote {
                                    permit.send(Bytes::copy_from_slice(data));
                                }
                            }
                            Err(_) => break,
                        },
                        Err(TrySendError::Full(())) => break,
                        Err(TrySendError::Closed(())) => {
                            entry.to_conn = None;
                            break;
                        }
                    }
                }
            }

            loop {
                match entry.from_conn.try_recv() {
                    Ok(datagram) => {
                        if sock.send_slice(&datagram, entry.remote).is_err() {
                            trace!("udp datagram dropped, tx buffer full");
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        sockets.remove(entry.handle);
                        return false;
                    }
                }
            }
            true
        });

        if dial_rx.is_closed()
            && inbound_rx.is_closed()
            && tcp_entries.is_empty()
            && udp_entries.is_empty()
        {
            debug!("virtual stack dataplane exiting");
            return;
        }

        if !device.inbound.is_empty() || !device.outbound.is_empty() {
            tokio::task::yield_now().await;
            continue;
        }

        let delay = iface
            .poll_delay(now, &sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
            .unwrap_or(IDLE_POLL_MAX)
            .min(IDLE_POLL_MAX);

        tokio::select! {
            frame = inbound_rx.recv(), if !inbound_rx.is_closed() => {
                if let Some(frame) = frame {
                    if device.inbound.len() < INBOUND_QUEUE_MAX {
                        device.inbound.push_back(frame);
                    }
                }
            }
            request = dial_rx.recv(), if !dial_rx.is_closed() => {
                if let Some(request) = request {
                    open_socket(
                        request,
                        &local_addrs,
                        &mut iface,
                        &mut sockets,
                        &mut tcp_entries,
                        &mut udp_entries,
                        &mut next_port,
                    );
                }
            }
            _ = wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn open_socket(
    request: DialRequest,
    local_addrs: &[IpAddr],
    iface: &mut Interface,
    sockets: &mut SocketSet<'static>,
    tcp_entries: &mut Vec<TcpEntry>,
    udp_entries: &mut Vec<UdpEntry>,
    next_port: &mut u16,
) {
    match request {
        DialRequest::Tcp {
            remote,
            to_conn,
            from_conn,
            ready,
        } => {
            let Some(local_ip) = local_addr_for(local_addrs, &remote) else {
                let _ = ready.send(Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "no inner address for this address family",
                )));
                return;
            };
            let mut sock = tcp::Socket::new(
                tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
                tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
            );
            let local = IpListenEndpoint {
                addr: Some(to_smol(local_ip)),
                port: alloc_port(next_port),
            };
            let endpoint = IpEndpoint::new(to_smol(remote.ip()), remote.port());
            match sock.connect(iface.context(), endpoint, local) {
                Ok(()) => {
                    let handle = sockets.add(sock);
                    tcp_entries.push(TcpEntry {
                        handle,
                        to_conn: Some(to_conn),
                        from_conn,
                        ready: Some(ready),
                        tx_pending: None,
                    });
                }
                Err(e) => {
                    let _ = ready.send(Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        e.to_string(),
                    )));
                }
            }
        }
        DialRequest::Udp {
            remote,
            to_conn,
            from_conn,
            ready,
        } => {
            let Some(local_ip) = local_addr_for(local_addrs, &remote) else {
                let _ = ready.send(Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "no inner address for this address family",
                )));
                return;
            };
            let mut sock = udp::Socket::new(
                udp::PacketBuffer::new(
                    vec![udp::PacketMetadata::EMPTY; UDP_PACKET_META],
                    vec![0u8; UDP_BUFFER],
                ),
                udp::PacketBuffer::new(
                    vec![udp::PacketMetadata::EMPTY; UDP_PACKET_META],
                    vec![0u8; UDP_BUFFER],
                ),
            );
            let local = IpListenEndpoint {
                addr: Some(to_smol(local_ip)),
                port: alloc_port(next_port),
            };
            match sock.bind(local) {
                Ok(()) => {
                    let handle = sockets.add(sock);
                    udp_entries.push(UdpEntry {
                        handle,
                        remote: IpEndpoint::new(to_smol(remote.ip()), remote.port()),
                        to_conn: Some(to_conn),
                        from_conn,
                    });
                    let _ = ready.send(Ok(()));
                }
                Err(e) => {
                    let _ = ready.send(Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        e.to_string(),
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn inner_v4() -> IpAddr {
        "172.16.0.2".parse().unwrap()
    }

    #[test]
    fn rejects_empty_address_list() {
        let err = VirtualStack::new(&[], vec![], 1280).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn rejects_nonsensical_mtu() {
        assert!(VirtualStack::new(&[inner_v4()], vec![], 100).is_err());
        assert!(VirtualStack::new(&[inner_v4()], vec![], 70_000).is_err());
    }

    fn parse_ipv4_header(frame: &[u8]) -> (u8, IpAddr, IpAddr) {
        assert!(frame.len() >= 20, "short frame: {} bytes", frame.len());
        assert_eq!(frame[0] >> 4, 4, "not IPv4");
        let proto = frame[9];
        let src = IpAddr::from(Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]));
        let dst = IpAddr::from(Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]));
        (proto, src, dst)
    }

    #[tokio::test]
    async fn tcp_dial_emits_syn() {
        let (mut packets, socket_face) =
            VirtualStack::new(&[inner_v4()], vec![], 1280).unwrap();

        let dial = tokio::spawn(async move {
            // Never completes: nothing answers the handshake. The dial
            // itself must still produce a SYN on the packet face.
            let _ = socket_face.dial_tcp("192.0.2.10:80".parse().unwrap()).await;
        });

        let frame = tokio::time::timeout(Duration::from_secs(5), packets.read())
            .await
            .expect("no outbound frame")
            .expect("stack closed");
        let (proto, src, dst) = parse_ipv4_header(&frame);
        assert_eq!(proto, 6, "expected TCP");
        assert_eq!(src, inner_v4());
        assert_eq!(dst, "192.0.2.10".parse::<IpAddr>().unwrap());

        let ihl = ((frame[0] & 0x0F) as usize) * 4;
        let dst_port = u16::from_be_bytes([frame[ihl + 2], frame[ihl + 3]]);
        assert_eq!(dst_port, 80);
        let flags = frame[ihl + 13];
        assert_eq!(flags & 0x02, 0x02, "expected SYN");

        dial.abort();
    }

    #[tokio::test]
    async fn udp_dial_sends_datagram() {
        let (mut packets, socket_face) =
            VirtualStack::new(&[inner_v4()], vec![], 1280).unwrap();

        let mut conn = socket_face
            .dial_udp("9.9.9.9:53".parse().unwrap())
            .await
            .unwrap();
        conn.write_all(b"query").await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), packets.read())
            .await
            .expect("no outbound frame")
            .expect("stack closed");
        let (proto, src, dst) = parse_ipv4_header(&frame);
        assert_eq!(proto, 17, "expected UDP");
        assert_eq!(src, inner_v4());
        assert_eq!(dst, "9.9.9.9".parse::<IpAddr>().unwrap());

        let ihl = ((frame[0] & 0x0F) as usize) * 4;
        let dst_port = u16::from_be_bytes([frame[ihl + 2], frame[ihl + 3]]);
        assert_eq!(dst_port, 53);
        assert_eq!(&frame[frame.len() - 5..], b"query");
    }

    #[tokio::test]
    async fn dial_rejects_missing_family() {
        let (_packets, socket_face) =
            VirtualStack::new(&[inner_v4()], vec![], 1280).unwrap();

        let err = socket_face
            .dial_tcp("[2001:db8::1]:443".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }

    #[tokio::test]
    async fn dial_rejects_unknown_network() {
        let (_packets, socket_face) =
            VirtualStack::new(&[inner_v4()], vec![], 1280).unwrap();

        let err = socket_face
            .dial("unix", "192.0.2.1:1".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
