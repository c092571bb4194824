//! Consumer address matchers: exact IP, inclusive range, CIDR.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::config::MatchConfig;
use crate::error::{GudgeonError, Result};

/// Maps both families onto one comparable key (v4 addresses use their
/// v6-mapped form) so ranges can span either notation.
fn ip_key(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

#[derive(Debug, Clone)]
pub enum AddressMatcher {
    Exact(IpAddr),
    Range { start: u128, end: u128 },
    Net(IpNet),
}

impl AddressMatcher {
    pub fn from_config(config: &MatchConfig) -> Result<Self> {
        if let Some(ip) = &config.ip {
            let ip: IpAddr = ip
                .parse()
                .map_err(|_| GudgeonError::Config(format!("bad match ip '{ip}'")))?;
            return Ok(Self::Exact(ip));
        }
        if let Some(range) = &config.range {
            let start: IpAddr = range
                .start
                .parse()
                .map_err(|_| GudgeonError::Config(format!("bad range start '{}'", range.start)))?;
            let end: IpAddr = range
                .end
                .parse()
                .map_err(|_| GudgeonError::Config(format!("bad range end '{}'", range.end)))?;
            return Ok(Self::Range {
                start: ip_key(start),
                end: ip_key(end),
            });
        }
        if let Some(net) = &config.net {
            let net: IpNet = net
                .parse()
                .map_err(|_| GudgeonError::Config(format!("bad match net '{net}'")))?;
            return Ok(Self::Net(net));
        }
        Err(GudgeonError::Config(
            "consumer match needs one of ip, range or net".to_string(),
        ))
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Self::Exact(expected) => ip_key(*expected) == ip_key(ip),
            Self::Range { start, end } => {
                let key = ip_key(ip);
                *start <= key && key <= *end
            }
            Self::Net(net) => match (net, ip) {
                (IpNet::V4(net), IpAddr::V4(v4)) => net.contains(&v4),
                (IpNet::V6(net), IpAddr::V6(v6)) => net.contains(&v6),
                _ => false,
            },
        }
    }

    /// Lower ranks first: exact ip > range > cidr.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::Exact(_) => 0,
            Self::Range { .. } => 1,
            Self::Net(_) => 2,
        }
    }
}
