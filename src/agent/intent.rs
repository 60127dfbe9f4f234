use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net;

use crate::error::RelayError;
use crate::protocol::PingRequest;
use crate::{PING_MAX_INTERVAL, PING_MAX_PAYLOAD_LEN, PING_MAX_TIMEOUT, PING_MIN_INTERVAL};

/// A validated ping request with its target resolved. Fixed for the
/// lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingIntent {
    /// The target as the client named it
    pub host: String,
    pub target: Ipv4Addr,
    /// None = until the client disconnects
    pub count: Option<u32>,
    pub interval: Duration,
    pub timeout: Duration,
    pub payload_len: usize,
}

impl PingIntent {
    /// Validates `request` and resolves its target.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidIntent`] for out-of-range parameters or an IPv6
    /// target, [`RelayError::Unresolvable`] if the host name does not resolve
    /// to an IPv4 address.
    pub async fn from_request(request: &PingRequest) -> Result<Self, RelayError> {
        check(request)?;
        let target = resolve_target(&request.target).await?;

        Ok(Self {
            host: request.target.clone(),
            target,
            count: request.count,
            interval: request.interval(),
            timeout: request.timeout(),
            payload_len: request.payload_len as usize,
        })
    }
}

fn invalid(msg: impl Into<String>) -> RelayError {
    RelayError::InvalidIntent(msg.into())
}

/// Range checks that need no I/O.
pub(crate) fn check(request: &PingRequest) -> Result<(), RelayError> {
    if request.target.trim().is_empty() {
        return Err(invalid("no target host"));
    }
    if request.count == Some(0) {
        return Err(invalid("count must be at least 1"));
    }

    let interval = request.interval();
    if interval < PING_MIN_INTERVAL || interval > PING_MAX_INTERVAL {
        return Err(invalid(format!(
            "interval {} ms outside {}..={} ms",
            request.interval_ms,
            PING_MIN_INTERVAL.as_millis(),
            PING_MAX_INTERVAL.as_millis()
        )));
    }

    let timeout = request.timeout();
    if timeout.is_zero() || timeout > PING_MAX_TIMEOUT {
        return Err(invalid(format!(
            "timeout {} ms outside 1..={} ms",
            request.timeout_ms,
            PING_MAX_TIMEOUT.as_millis()
        )));
    }

    if request.payload_len > PING_MAX_PAYLOAD_LEN {
        return Err(invalid(format!(
            "payload of {} bytes exceeds {}",
            request.payload_len, PING_MAX_PAYLOAD_LEN
        )));
    }

    Ok(())
}

async fn resolve_target(host: &str) -> Result<Ipv4Addr, RelayError> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return match addr {
            IpAddr::V4(v4) if v4.is_unspecified() || v4.is_broadcast() || v4.is_multicast() => {
                Err(invalid(format!("{v4} is not a unicast address")))
            }
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => Err(invalid("IPv6 targets are not supported")),
        };
    }

    let addrs = net::lookup_host((host, 0))
        .await
        .map_err(|_| RelayError::Unresolvable(host.to_string()))?;

    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| RelayError::Unresolvable(host.to_string()))
}
