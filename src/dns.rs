//! Hostname resolution for the dial surface.
//!
//! The default mode sends plain DNS queries to the configured servers over
//! UDP dialled through the virtual stack, so lookups travel the tunnel like
//! any other traffic. Local mode bypasses the stack and asks the host
//! resolver instead.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::netstack::SocketFace;

const DNS_PORT: u16 = 53;
const MAX_RESPONSE: usize = 4096;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no DNS servers configured")]
    NoServers,

    #[error("no address records for {0}")]
    NoRecords(String),

    #[error("invalid hostname {0:?}")]
    InvalidName(String),

    #[error("query failed: {0}")]
    Query(String),
}

enum Mode {
    /// Queries are dialled through the virtual stack.
    Tunnelled(SocketFace),
    /// Queries go to the host resolver directly.
    Local,
}

/// Resolver handed to the proxy frontends.
pub struct TunnelResolver {
    mode: Mode,
    servers: Vec<IpAddr>,
    timeout: Duration,
}

impl TunnelResolver {
    /// Resolve through the tunnel using the given servers, in list order.
    pub fn tunnelled(face: SocketFace, servers: Vec<IpAddr>, timeout: Duration) -> Self {
        Self {
            mode: Mode::Tunnelled(face),
            servers,
            timeout,
        }
    }

    /// Resolve via the host resolver, bypassing the tunnel.
    pub fn local(timeout: Duration) -> Self {
        Self {
            mode: Mode::Local,
            servers: Vec::new(),
            timeout,
        }
    }

    /// Resolve a hostname to one address. Literal IPs pass straight through.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        match &self.mode {
            Mode::Local => self.resolve_local(host).await,
            Mode::Tunnelled(face) => {
                if self.servers.is_empty() {
                    return Err(ResolveError::NoServers);
                }
                for server in &self.servers {
                    for rtype in [RecordType::A, RecordType::AAAA] {
                        let query = query_server(face, *server, host, rtype);
                        match tokio::time::timeout(self.timeout, query).await {
                            Ok(Ok(Some(ip))) => return Ok(ip),
                            Ok(Ok(None)) => {}
                            Ok(Err(e)) => {
                                debug!(%server, host, %e, "DNS query failed");
                                break;
                            }
                            Err(_) => {
                                debug!(%server, host, "DNS query timed out");
                                break;
                            }
                        }
                    }
                }
                Err(ResolveError::NoRecords(host.to_string()))
            }
        }
    }

    async fn resolve_local(&self, host: &str) -> Result<IpAddr, ResolveError> {
        let lookup = tokio::net::lookup_host((host, 0u16));
        let addrs: Vec<SocketAddr> = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| ResolveError::Query(format!("lookup of {host} timed out")))?
            .map_err(|e| ResolveError::Query(e.to_string()))?
            .collect();
        // Prefer IPv4: a v4-only inner configuration cannot route v6 targets.
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| a.ip())
            .ok_or_else(|| ResolveError::NoRecords(host.to_string()))
    }
}

async fn query_server(
    face: &SocketFace,
    server: IpAddr,
    host: &str,
    rtype: RecordType,
) -> Result<Option<IpAddr>, ResolveError> {
    let message = build_query(host, rtype)?;
    let id = message.id();
    let wire = message
        .to_vec()
        .map_err(|e| ResolveError::Query(e.to_string()))?;

    let mut conn = face
        .dial_udp(SocketAddr::new(server, DNS_PORT))
        .await
        .map_err(|e| ResolveError::Query(e.to_string()))?;
    conn.write_all(&wire)
        .await
        .map_err(|e| ResolveError::Query(e.to_string()))?;

    let mut buf = vec![0u8; MAX_RESPONSE];
    let n = conn
        .read(&mut buf)
        .await
        .map_err(|e| ResolveError::Query(e.to_string()))?;
    trace!(%server, host, bytes = n, "DNS response");
    parse_answer(&buf[..n], id, rtype)
}

fn build_query(host: &str, rtype: RecordType) -> Result<Message, ResolveError> {
    let name =
        Name::from_utf8(host).map_err(|_| ResolveError::InvalidName(host.to_string()))?;
    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, rtype));
    Ok(message)
}

fn parse_answer(
    wire: &[u8],
    expected_id: u16,
    rtype: RecordType,
) -> Result<Option<IpAddr>, ResolveError> {
    let message = Message::from_vec(wire).map_err(|e| ResolveError::Query(e.to_string()))?;
    if message.id() != expected_id {
        return Err(ResolveError::Query("response id mismatch".into()));
    }
    if message.response_code() != ResponseCode::NoError {
        return Err(ResolveError::Query(format!(
            "server answered {}",
            message.response_code()
        )));
    }

    for record in message.answers() {
        match (rtype, record.data()) {
            (RecordType::A, Some(RData::A(a))) => return Ok(Some(IpAddr::V4(a.0))),
            (RecordType::AAAA, Some(RData::AAAA(aaaa))) => return Ok(Some(IpAddr::V6(aaaa.0))),
            _ => {}
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Record;

    fn answer_for(query: &Message, rdata: RData) -> Vec<u8> {
        let mut response = Message::new();
        response
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(ResponseCode::NoError);
        let name = query.queries()[0].name().clone();
        response.add_answer(Record::from_rdata(name, 60, rdata));
        response.to_vec().unwrap()
    }

    #[test]
    fn query_has_expected_shape() {
        let message = build_query("example.com", RecordType::A).unwrap();
        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.queries()[0].query_type(), RecordType::A);
        assert!(message.recursion_desired());
    }

    #[test]
    fn rejects_invalid_hostname() {
        assert!(matches!(
            build_query("exa mple..", RecordType::A),
            Err(ResolveError::InvalidName(_))
        ));
    }

    #[test]
    fn parses_a_answer() {
        let query = build_query("example.com", RecordType::A).unwrap();
        let wire = answer_for(&query, RData::A(A("93.184.216.34".parse().unwrap())));
        let ip = parse_answer(&wire, query.id(), RecordType::A).unwrap();
        assert_eq!(ip, Some("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn parses_aaaa_answer() {
        let query = build_query("example.com", RecordType::AAAA).unwrap();
        let wire = answer_for(&query, RData::AAAA(AAAA("2606:2800:220:1::".parse().unwrap())));
        let ip = parse_answer(&wire, query.id(), RecordType::AAAA).unwrap();
        assert_eq!(ip, Some("2606:2800:220:1::".parse().unwrap()));
    }

    #[test]
    fn rejects_mismatched_id() {
        let query = build_query("example.com", RecordType::A).unwrap();
        let wire = answer_for(&query, RData::A(A("192.0.2.1".parse().unwrap())));
        let err = parse_answer(&wire, query.id().wrapping_add(1), RecordType::A).unwrap_err();
        assert!(matches!(err, ResolveError::Query(_)));
    }

    #[test]
    fn empty_answer_is_none_not_error() {
        let query = build_query("example.com", RecordType::A).unwrap();
        let mut response = Message::new();
        response
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NoError);
        let wire = response.to_vec().unwrap();
        assert_eq!(parse_answer(&wire, query.id(), RecordType::A).unwrap(), None);
    }

    #[tokio::test]
    async fn literal_ip_bypasses_servers() {
        let resolver = TunnelResolver::local(Duration::from_secs(1));
        let ip = resolver.resolve("1.1.1.1").await.unwrap();
        assert_eq!(ip, "1.1.1.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn empty_server_list_fails_fast() {
        let (_packets, face) = crate::netstack::VirtualStack::new(
            &["172.16.0.2".parse().unwrap()],
            vec![],
            1280,
        )
        .unwrap();
        let resolver = TunnelResolver::tunnelled(face, vec![], Duration::from_secs(1));
        assert!(matches!(
            resolver.resolve("example.com").await,
            Err(ResolveError::NoServers)
        ));
    }
}
