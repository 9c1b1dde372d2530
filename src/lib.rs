//! Local proxy facade: accepts plain HTTP/1.x proxy traffic on a loopback
//! port and relays it to an upstream corporate proxy (HTTP, SOCKS4, SOCKS5,
//! PAC-selected or direct), adding the authentication and tunneling the
//! client cannot do itself.

pub mod auth;
pub mod blacklist;
pub mod client;
pub mod config;
pub mod error;
pub mod pac;
pub mod processor;
pub mod selector;
pub mod server;
pub mod sysproxy;
pub mod tunnel;
