//! Interception Stack (C5): CA pool, transparent HTTP(S) MITM, SNI/
//! ClientHello sniffing, TCP passthrough, a DNS proxy, and the rule/
//! callback pipeline.
//!
//! Reached via host packet redirection the supervisor installs on create
//! and tears down on close (`firewall::FirewallController`); this module
//! owns the four listeners (`HTTP_PORT`, `HTTPS_PORT`, `PASSTHROUGH_PORT`,
//! `DNS_PORT`) and the per-sandbox CA pool, and is built fresh for every
//! sandbox that needs interception.

mod ca;
mod dns;
mod firewall;
mod http;
mod http_proxy;
mod https_proxy;
mod passthrough;
mod proxy_pipe;
pub mod rules;
mod sse;
mod stack;

pub use ca::{CaPool, LeafCert};
pub use dns::DnsProxy;
pub use firewall::{FirewallController, FirewallRules, NoopFirewall, DNS_PORT, HTTP_PORT, HTTPS_PORT, PASSTHROUGH_PORT};
pub use passthrough::{NoDestinationResolver, OriginalDestinationResolver};
pub use rules::{NetworkHookRule, RuleAction, RulePhase};
pub use stack::{InterceptionConfig, InterceptionStack};
