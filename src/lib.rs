//! # domino
//!
//! Unofficial client for a MASQUE-based consumer VPN. IP traffic rides
//! HTTP/3 extended CONNECT (`connect-ip`) datagrams over QUIC to the
//! provider endpoint; on the local side the tunnel is exposed through a
//! userspace TCP/IP stack as a SOCKS5 proxy, so ordinary applications get
//! VPN connectivity without a TUN device, routing changes, or root.
//!
//! ```text
//!  SOCKS5 client
//!       │
//!  ┌────▼─────┐   dial    ┌──────────────┐
//!  │  socks   ├──────────►│  netstack    │  userspace TCP/IP,
//!  └──────────┘           │ (smoltcp)    │  inner addresses
//!       │ resolve         └──────┬───────┘
//!  ┌────▼─────┐            IP packets
//!  │   dns    │           ┌──────▼───────┐
//!  └──────────┘           │   session    │  CONNECT-IP over
//!                         │ (quinn + h3) │  QUIC datagrams
//!                         └──────┬───────┘
//!                       ┌────────▼────────┐
//!                       │   supervisor    │  reconnect loop
//!                       └─────────────────┘
//! ```
//!
//! The virtual stack outlives every session: reconnects replace the QUIC
//! connection underneath it while user connections stall and resume.

pub mod config;
pub mod dns;
pub mod error;
pub mod masque;
pub mod netstack;
pub mod session;
pub mod socks;
pub mod supervisor;
pub mod tls;
