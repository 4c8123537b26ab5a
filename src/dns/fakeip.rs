// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ipnet::IpNet;
use lru::LruCache;
use tracing::{debug, trace};

use crate::dns::Error;

/// Allocates fake addresses for domains out of a CIDR range.
///
/// Addresses are handed out sequentially from the first address of the range and wrap around
/// once the end is reached. At most `capacity` bindings are live at once; admitting a new domain
/// into a full pool evicts the least recently used binding, which releases its address for
/// reallocation.
#[derive(Debug)]
pub struct FakeIpPool {
    network: IpNet,
    size: u128,
    capacity: usize,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    /// Offset into the range of the next address to try.
    cursor: u128,
    domains: LruCache<String, IpAddr>,
    addresses: HashMap<IpAddr, String>,
}

impl FakeIpPool {
    /// Creates a pool over `cidr` holding at most `capacity` bindings. The capacity is clamped
    /// to the size of the range.
    pub fn new(cidr: &str, capacity: usize) -> Result<Self, Error> {
        let network: IpNet = cidr
            .parse()
            .map_err(|e| Error::InvalidCidr(cidr.to_string(), e))?;
        let network = network.trunc();
        let Some(requested) = NonZeroUsize::new(capacity) else {
            return Err(Error::InvalidCapacity(capacity));
        };

        let host_bits = u32::from(network.max_prefix_len() - network.prefix_len());
        let size = 1u128.checked_shl(host_bits).unwrap_or(u128::MAX);
        let capacity = if requested.get() as u128 > size {
            NonZeroUsize::new(size as usize).unwrap_or(requested)
        } else {
            requested
        };

        Ok(Self {
            network,
            size,
            capacity: capacity.get(),
            state: Mutex::new(PoolState {
                cursor: 0,
                domains: LruCache::new(capacity),
                addresses: HashMap::new(),
            }),
        })
    }

    /// Returns the address bound to the domain. When the domain has no live binding and
    /// `allocate` is set, the next free address of the range is bound to it.
    pub fn get_fake_ip_for_domain(&self, domain: &str, allocate: bool) -> Option<IpAddr> {
        let domain = normalize(domain);
        let mut state = self.lock();
        if let Some(addr) = state.domains.get(&domain) {
            return Some(*addr);
        }
        if !allocate {
            return None;
        }

        if state.domains.len() >= self.capacity
            && let Some((evicted, addr)) = state.domains.pop_lru()
        {
            debug!(domain=%evicted, %addr, "evicting fake ip binding");
            state.addresses.remove(&addr);
        }

        // There is always a free address here: the live bindings are fewer than the capacity,
        // which does not exceed the size of the range.
        let addr = loop {
            let candidate = self.address_at(state.cursor);
            state.cursor = if state.cursor + 1 >= self.size {
                0
            } else {
                state.cursor + 1
            };
            if !state.addresses.contains_key(&candidate) {
                break candidate;
            }
        };

        trace!(%domain, %addr, "allocated fake ip");
        state.addresses.insert(addr, domain.clone());
        state.domains.put(domain, addr);
        Some(addr)
    }

    /// Returns the domain currently bound to the address, if any.
    pub fn get_domain_from_fake_ip(&self, addr: &IpAddr) -> Option<String> {
        self.lock().addresses.get(addr).cloned()
    }

    /// Whether the address falls in the range of this pool.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.network.contains(addr)
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.network, IpNet::V4(_))
    }

    pub fn network(&self) -> IpNet {
        self.network
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.lock().domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn address_at(&self, offset: u128) -> IpAddr {
        match self.network {
            IpNet::V4(net) => {
                let base = u32::from(net.network());
                IpAddr::V4(Ipv4Addr::from(base.wrapping_add(offset as u32)))
            }
            IpNet::V6(net) => {
                let base = u128::from(net.network());
                IpAddr::V6(Ipv6Addr::from(base.wrapping_add(offset)))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// The fake address pools of a proxy, typically one per address family.
#[derive(Debug, Default)]
pub struct FakeIpPoolSet {
    pools: Vec<FakeIpPool>,
}

impl FakeIpPoolSet {
    pub fn new(pools: Vec<FakeIpPool>) -> Self {
        Self { pools }
    }

    /// Builds a set from (cidr, capacity) pairs, failing on the first invalid pool.
    pub fn from_ranges<'a>(
        ranges: impl IntoIterator<Item = (&'a str, usize)>,
    ) -> Result<Self, Error> {
        let pools = ranges
            .into_iter()
            .map(|(cidr, capacity)| FakeIpPool::new(cidr, capacity))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(pools))
    }

    pub fn pools(&self) -> &[FakeIpPool] {
        &self.pools
    }

    /// The first IPv4 pool, if one is configured.
    pub fn ipv4(&self) -> Option<&FakeIpPool> {
        self.pools.iter().find(|pool| pool.is_ipv4())
    }

    /// The first IPv6 pool, if one is configured.
    pub fn ipv6(&self) -> Option<&FakeIpPool> {
        self.pools.iter().find(|pool| !pool.is_ipv4())
    }

    /// Allocates (or reuses) an address for the domain in every pool.
    pub fn get_fake_ips_for_domain(&self, domain: &str) -> Vec<IpAddr> {
        self.pools
            .iter()
            .filter_map(|pool| pool.get_fake_ip_for_domain(domain, true))
            .collect()
    }

    /// Looks the address up in the pool whose range contains it.
    pub fn get_domain_from_fake_ip(&self, addr: &IpAddr) -> Option<String> {
        self.pools
            .iter()
            .filter(|pool| pool.contains(addr))
            .find_map(|pool| pool.get_domain_from_fake_ip(addr))
    }

    /// Pure range membership test against the pools of the address' family. Whether the
    /// address is currently allocated does not matter.
    pub fn is_ip_in_ip_pool(&self, addr: &IpAddr) -> bool {
        self.pools.iter().any(|pool| pool.contains(addr))
    }
}
