//! Collision-free subnet allocation for per-run networks.
//!
//! # Scheme
//!
//! ```text
//! 10.{r}.0.0/16       - randomized base range for this run
//! 10.{r}.{n}.0/24     - first /24 not intersecting any engine network
//! 10.{r+2}.0.0/16     - next base when the current one is claimed or full
//! ```
//!
//! The base moves within its enclosing `/8`, so allocation never leaves the
//! private range it started in.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rand::Rng;
use tracing::{debug, trace};

use crate::error::{TestnetError, TestnetResult};

/// Prefix length of allocated subnets.
pub const SUBNET_PREFIX: u8 = 24;

/// Base ranges tried before giving up.
pub const DEFAULT_MAX_BASE_ATTEMPTS: usize = 64;

/// Finds free `/24` subnets inside a base range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetAllocator {
    base: Ipv4Net,
    max_base_attempts: usize,
}

impl SubnetAllocator {
    /// Create an allocator for a base range.
    ///
    /// # Errors
    ///
    /// Returns error if the base range is narrower than a `/24`.
    pub fn new(base: Ipv4Net) -> TestnetResult<Self> {
        if base.prefix_len() > SUBNET_PREFIX {
            return Err(TestnetError::InvalidCidr {
                cidr: base.to_string(),
                reason: format!("base range must be /{SUBNET_PREFIX} or wider"),
            });
        }
        Ok(Self {
            base: base.trunc(),
            max_base_attempts: DEFAULT_MAX_BASE_ATTEMPTS,
        })
    }

    /// Parse a base range such as `10.42.0.0/16`.
    ///
    /// # Errors
    ///
    /// Returns error if the CIDR is unparseable or too narrow.
    pub fn parse(base: &str) -> TestnetResult<Self> {
        let net: Ipv4Net = base.parse().map_err(|e: ipnet::AddrParseError| {
            TestnetError::InvalidCidr {
                cidr: base.to_string(),
                reason: e.to_string(),
            }
        })?;
        Self::new(net)
    }

    /// Allocator over a random `10.x.0.0/16`, so parallel runs start apart.
    #[must_use]
    pub fn randomized() -> Self {
        let octet: u8 = rand::thread_rng().gen_range(0..=255);
        Self {
            base: Ipv4Net::new(Ipv4Addr::new(10, octet, 0, 0), 16)
                .unwrap_or_else(|_| Ipv4Net::default()),
            max_base_attempts: DEFAULT_MAX_BASE_ATTEMPTS,
        }
    }

    /// Bound the number of base ranges tried.
    #[must_use]
    pub fn with_max_base_attempts(mut self, attempts: usize) -> Self {
        self.max_base_attempts = attempts.max(1);
        self
    }

    /// First base range tried.
    #[must_use]
    pub const fn base(&self) -> Ipv4Net {
        self.base
    }

    /// Find the first `/24` that intersects none of `used`.
    ///
    /// A base range entirely covered by one used subnet is skipped without
    /// scanning. Each retry advances the base by two of its own widths.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::SubnetExhausted`] when every tried base is full.
    pub fn find_available_subnet(&self, used: &[Ipv4Net]) -> TestnetResult<Ipv4Net> {
        let mut base = self.base;

        for attempt in 0..self.max_base_attempts {
            if used.iter().any(|u| u.contains(&base)) {
                trace!(base = %base, attempt, "base range fully claimed");
            } else if let Some(subnet) = first_free_block(base, used)? {
                debug!(subnet = %subnet, base = %base, attempt, "allocated subnet");
                return Ok(subnet);
            } else {
                trace!(base = %base, attempt, "no free /24 in base range");
            }
            base = next_base(base)?;
        }

        Err(TestnetError::SubnetExhausted {
            start: self.base,
            attempts: self.max_base_attempts,
        })
    }
}

/// Allocate from a base range given as a string.
///
/// # Errors
///
/// Returns error if `base` is unparseable or no subnet is free.
pub fn find_available_subnet(base: &str, used: &[Ipv4Net]) -> TestnetResult<Ipv4Net> {
    SubnetAllocator::parse(base)?.find_available_subnet(used)
}

/// Whether two subnets share any address.
#[must_use]
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Parse engine-reported subnets, skipping IPv6 and anything malformed.
pub fn parse_used<I, S>(subnets: I) -> Vec<Ipv4Net>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    subnets
        .into_iter()
        .filter_map(|s| {
            let s = s.as_ref();
            match s.parse::<Ipv4Net>() {
                Ok(net) => Some(net.trunc()),
                Err(_) => {
                    trace!(subnet = %s, "ignoring non-IPv4 subnet");
                    None
                }
            }
        })
        .collect()
}

fn first_free_block(base: Ipv4Net, used: &[Ipv4Net]) -> TestnetResult<Option<Ipv4Net>> {
    let blocks = base
        .subnets(SUBNET_PREFIX)
        .map_err(|e| TestnetError::InvalidCidr {
            cidr: base.to_string(),
            reason: e.to_string(),
        })?;
    Ok(blocks.into_iter().find(|block| !used.iter().any(|u| overlaps(block, u))))
}

fn next_base(base: Ipv4Net) -> TestnetResult<Ipv4Net> {
    let width = 1u64 << (32 - u32::from(base.prefix_len()));
    let addr = u32::from(base.network());
    let top = addr & 0xFF00_0000;
    #[allow(clippy::cast_possible_truncation)]
    let rest = ((u64::from(addr & 0x00FF_FFFF) + 2 * width) & 0x00FF_FFFF) as u32;

    Ipv4Net::new(Ipv4Addr::from(top | rest), base.prefix_len()).map_err(|e| {
        TestnetError::InvalidCidr {
            cidr: base.to_string(),
            reason: e.to_string(),
        }
    })
}
