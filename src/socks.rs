//! SOCKS5 frontend over the dial surface.
//!
//! Deliberately thin: greeting, optional username/password, CONNECT. The
//! interesting part is what it closes over, not the protocol handling.
//! Credentials are checked before anything touches the tunnel.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dns::TunnelResolver;
use crate::netstack::SocketFace;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_FAILURE: u8 = 0x01;
const REP_NET_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_REFUSED: u8 = 0x05;
const REP_CMD_UNSUPPORTED: u8 = 0x07;
const REP_ATYP_UNSUPPORTED: u8 = 0x08;

/// SOCKS5 listener state: the dial surface, the resolver, and optional
/// static credentials.
pub struct SocksServer {
    dialer: SocketFace,
    resolver: Arc<TunnelResolver>,
    auth: Option<(String, String)>,
}

impl SocksServer {
    pub fn new(
        dialer: SocketFace,
        resolver: Arc<TunnelResolver>,
        auth: Option<(String, String)>,
    ) -> Self {
        Self {
            dialer,
            resolver,
            auth,
        }
    }

    /// Accept loop. Runs until cancelled; per-connection failures only end
    /// that connection.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "socks client connected");
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle(stream).await {
                                debug!(%peer, %e, "socks connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        // Transient accept errors (fd pressure) must not
                        // kill the listener.
                        warn!(%e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }

    /// Drive one client connection. Generic over the stream so tests can
    /// exercise the protocol over an in-memory duplex.
    pub async fn handle<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        ensure!(head[0] == SOCKS_VERSION, "not a SOCKS5 client");
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;

        match &self.auth {
            Some((user, pass)) => {
                if !methods.contains(&METHOD_USERPASS) {
                    stream
                        .write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])
                        .await?;
                    bail!("client offers no username/password method");
                }
                stream.write_all(&[SOCKS_VERSION, METHOD_USERPASS]).await?;

                let mut header = [0u8; 2];
                stream.read_exact(&mut header).await?;
                ensure!(header[0] == AUTH_VERSION, "bad auth subnegotiation");
                let mut username = vec![0u8; header[1] as usize];
                stream.read_exact(&mut username).await?;
                let mut pass_len = [0u8; 1];
                stream.read_exact(&mut pass_len).await?;
                let mut password = vec![0u8; pass_len[0] as usize];
                stream.read_exact(&mut password).await?;

                if username != user.as_bytes() || password != pass.as_bytes() {
                    stream.write_all(&[AUTH_VERSION, 0x01]).await?;
                    bail!("rejected credentials");
                }
                stream.write_all(&[AUTH_VERSION, 0x00]).await?;
            }
            None => {
                if !methods.contains(&METHOD_NONE) {
                    stream
                        .write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])
                        .await?;
                    bail!("no acceptable auth method");
                }
                stream.write_all(&[SOCKS_VERSION, METHOD_NONE]).await?;
            }
        }

        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await?;
        ensure!(request[0] == SOCKS_VERSION, "bad request version");
        if request[1] != CMD_CONNECT {
            reply(&mut stream, REP_CMD_UNSUPPORTED).await?;
            bail!("unsupported command {:#04x}", request[1]);
        }

        let target = match request[3] {
            ATYP_V4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let mut port = [0u8; 2];
                stream.read_exact(&mut port).await?;
                SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), u16::from_be_bytes(port))
            }
            ATYP_V6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let mut port = [0u8; 2];
                stream.read_exact(&mut port).await?;
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), u16::from_be_bytes(port))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                let mut port = [0u8; 2];
                stream.read_exact(&mut port).await?;
                let host = std::str::from_utf8(&domain)?;
                match self.resolver.resolve(host).await {
                    Ok(ip) => SocketAddr::new(ip, u16::from_be_bytes(port)),
                    Err(e) => {
                        reply(&mut stream, REP_HOST_UNREACHABLE).await?;
                        bail!("resolving {host}: {e}");
                    }
                }
            }
            other => {
                reply(&mut stream, REP_ATYP_UNSUPPORTED).await?;
                bail!("unsupported address type {other:#04x}");
            }
        };

        let mut conn = match self.dialer.dial_tcp(target).await {
            Ok(conn) => conn,
            Err(e) => {
                let code = match e.kind() {
                    io::ErrorKind::ConnectionRefused => REP_REFUSED,
                    io::ErrorKind::AddrNotAvailable => REP_NET_UNREACHABLE,
                    _ => REP_FAILURE,
                };
                reply(&mut stream, code).await?;
                bail!("dialing {target}: {e}");
            }
        };
        reply(&mut stream, REP_SUCCESS).await?;
        debug!(%target, "socks connect established");

        let _ = tokio::io::copy_bidirectional(&mut stream, &mut conn).await;
        Ok(())
    }
}

async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8) -> io::Result<()> {
    // Bound address is not meaningful for this proxy; zeroes per convention.
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_V4, 0, 0, 0, 0, 0, 0])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netstack::VirtualStack;

    fn test_server(auth: Option<(&str, &str)>) -> Arc<SocksServer> {
        let (_packets, face) =
            VirtualStack::new(&["172.16.0.2".parse().unwrap()], vec![], 1280).unwrap();
        let resolver = Arc::new(TunnelResolver::local(Duration::from_secs(1)));
        Arc::new(SocksServer::new(
            face,
            resolver,
            auth.map(|(u, p)| (u.to_string(), p.to_string())),
        ))
    }

    #[tokio::test]
    async fn rejects_non_socks5_clients() {
        let server = test_server(None);
        let (mut client, server_side) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move { server.handle(server_side).await });

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn plain_greeting_negotiates_no_auth() {
        let server = test_server(None);
        let (mut client, server_side) = tokio::io::duplex(1024);
        let _task = tokio::spawn(async move { server.handle(server_side).await });

        client.write_all(&[SOCKS_VERSION, 1, METHOD_NONE]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [SOCKS_VERSION, METHOD_NONE]);
    }

    #[tokio::test]
    async fn bad_credentials_rejected_before_any_dial() {
        let server = test_server(Some(("u", "p")));
        let (mut client, server_side) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move { server.handle(server_side).await });

        client
            .write_all(&[SOCKS_VERSION, 1, METHOD_USERPASS])
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [SOCKS_VERSION, METHOD_USERPASS]);

        client
            .write_all(&[AUTH_VERSION, 1, b'u', 1, b'x'])
            .await
            .unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [AUTH_VERSION, 0x01], "auth must fail");
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn good_credentials_accepted() {
        let server = test_server(Some(("u", "p")));
        let (mut client, server_side) = tokio::io::duplex(1024);
        let _task = tokio::spawn(async move { server.handle(server_side).await });

        client
            .write_all(&[SOCKS_VERSION, 1, METHOD_USERPASS])
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();

        client
            .write_all(&[AUTH_VERSION, 1, b'u', 1, b'p'])
            .await
            .unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [AUTH_VERSION, 0x00]);
    }

    #[tokio::test]
    async fn auth_client_without_userpass_method_is_cut_off() {
        let server = test_server(Some(("u", "p")));
        let (mut client, server_side) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move { server.handle(server_side).await });

        client.write_all(&[SOCKS_VERSION, 1, METHOD_NONE]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [SOCKS_VERSION, METHOD_UNACCEPTABLE]);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn bind_command_is_refused() {
        let server = test_server(None);
        let (mut client, server_side) = tokio::io::duplex(1024);
        let _task = tokio::spawn(async move { server.handle(server_side).await });

        client.write_all(&[SOCKS_VERSION, 1, METHOD_NONE]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();

        // BIND request for 0.0.0.0:0.
        client
            .write_all(&[SOCKS_VERSION, 0x02, 0x00, ATYP_V4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_CMD_UNSUPPORTED);
    }
}
