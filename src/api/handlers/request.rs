//! Pull client signals out of request headers.

use std::{env, net::IpAddr};

use axum::http::{
    HeaderMap,
    header::{ACCEPT_LANGUAGE, USER_AGENT},
};

use crate::risk::RequestSignals;

/// Names the proxy header that carries the client address. Unset, the
/// socket peer is used and forwarding headers are ignored.
pub(crate) const IP_HEADER_ENV: &str = "HEIMDALL_IP_HEADER";

/// Client address as seen by the trusted edge.
pub(crate) fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    match env::var(IP_HEADER_ENV) {
        Ok(header) if !header.trim().is_empty() => {
            ip_from_headers(header.trim(), headers).or(peer)
        }
        _ => peer,
    }
}

/// The proxy appends the address it saw, so a list is read from the right.
fn ip_from_headers(header: &str, headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit(',').next())
        .map(str::trim)
        .and_then(|value| value.parse().ok())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn request_signals(headers: &HeaderMap, peer: Option<IpAddr>) -> RequestSignals {
    RequestSignals {
        user_agent: header_str(headers, USER_AGENT.as_str()).unwrap_or_default(),
        accept_language: header_str(headers, ACCEPT_LANGUAGE.as_str()),
        platform_hint: header_str(headers, "sec-ch-ua-platform")
            .map(|value| value.trim_matches('"').to_string())
            .filter(|value| !value.is_empty()),
        ip: client_ip(headers, peer),
    }
}
