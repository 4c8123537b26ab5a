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

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use hickory_proto::op::Message;
use lru::LruCache;
use tokio::time::Instant;
use tracing::trace;

use crate::dns::Error;
use crate::dns::message::record_address;
use crate::dns::name_util::{canonical, strip_fqdn};

/// Number of bindings kept per address.
pub const ENTRY_CAPACITY: usize = 4;

#[derive(Clone, Debug)]
struct Binding {
    domain: String,
    resolver: String,
    expires_at: Instant,
}

/// The bindings seen for one address. Once full, new bindings overwrite existing slots in a
/// fixed rotation starting at the first slot, regardless of age or use.
#[derive(Debug, Default)]
struct Entry {
    bindings: Vec<Binding>,
    cursor: usize,
}

impl Entry {
    fn add_domain(&mut self, domain: &str, resolver: &str, expires_at: Instant) {
        if let Some(existing) = self
            .bindings
            .iter_mut()
            .find(|b| b.domain == domain && b.resolver == resolver)
        {
            existing.expires_at = expires_at;
            return;
        }

        let binding = Binding {
            domain: domain.to_string(),
            resolver: resolver.to_string(),
            expires_at,
        };
        if self.bindings.len() < ENTRY_CAPACITY {
            self.bindings.push(binding);
        } else {
            self.bindings[self.cursor] = binding;
            self.cursor = (self.cursor + 1) % ENTRY_CAPACITY;
        }
    }

    fn live(&self, filter_expired: bool, now: Instant) -> impl Iterator<Item = &Binding> {
        self.bindings
            .iter()
            .filter(move |b| !filter_expired || b.expires_at > now)
    }
}

/// Maps addresses seen in DNS answers back to the domains (and the resolvers) that produced them.
///
/// The outer LRU is guarded by its own lock; each entry carries a separate lock so that readers
/// of different addresses never contend once the entry has been located.
pub struct ReverseResolutionCache {
    entries: RwLock<LruCache<IpAddr, Arc<RwLock<Entry>>>>,
    filter_expired: bool,
}

impl ReverseResolutionCache {
    /// Creates a cache holding at most `capacity` addresses.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        let capacity = NonZeroUsize::new(capacity).ok_or(Error::InvalidCapacity(capacity))?;
        Ok(Self {
            entries: RwLock::new(LruCache::new(capacity)),
            filter_expired: false,
        })
    }

    /// When enabled, lookups skip bindings whose TTL has passed. By default expired bindings are
    /// returned until they are overwritten or their address is evicted.
    pub fn with_expiry_filter(mut self, filter_expired: bool) -> Self {
        self.filter_expired = filter_expired;
        self
    }

    /// Records every A and AAAA answer of the message against the domain of its question.
    pub fn set_domain(&self, msg: &Message, resolver: &str) {
        let Some(question) = msg.queries().first() else {
            return;
        };
        let domain = strip_fqdn(&canonical(question.name()));
        let now = Instant::now();

        for record in msg.answers() {
            let Some(addr) = record_address(record) else {
                continue;
            };
            let expires_at = now + Duration::from_secs(record.ttl().into());
            let entry = self.entry(addr);
            write(&entry).add_domain(&domain, resolver, expires_at);
            trace!(%addr, %domain, resolver, "recorded reverse binding");
        }
    }

    /// Returns the domains bound to the address, in slot order. The same domain may appear once
    /// per resolver that returned it.
    pub fn get_domain(&self, addr: &IpAddr) -> Option<Vec<String>> {
        let entry = self.peek(addr)?;
        let now = Instant::now();
        let entry = read(&entry);
        let domains: Vec<String> = entry
            .live(self.filter_expired, now)
            .map(|b| b.domain.clone())
            .collect();
        (!domains.is_empty()).then_some(domains)
    }

    /// Returns the resolvers that bound the domain to the address.
    pub fn get_resolvers(&self, domain: &str, addr: &IpAddr) -> Option<Vec<String>> {
        let entry = self.peek(addr)?;
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let now = Instant::now();
        let entry = read(&entry);
        let resolvers: Vec<String> = entry
            .live(self.filter_expired, now)
            .filter(|b| b.domain == domain)
            .map(|b| b.resolver.clone())
            .collect();
        (!resolvers.is_empty()).then_some(resolvers)
    }

    /// Number of addresses held.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn peek(&self, addr: &IpAddr) -> Option<Arc<RwLock<Entry>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .peek(addr)
            .cloned()
    }

    fn entry(&self, addr: IpAddr) -> Arc<RwLock<Entry>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(&addr) {
            return entry.clone();
        }
        let entry = Arc::new(RwLock::new(Entry::default()));
        entries.put(addr, entry.clone());
        entry
    }
}

fn read(entry: &RwLock<Entry>) -> RwLockReadGuard<'_, Entry> {
    entry.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(entry: &RwLock<Entry>) -> RwLockWriteGuard<'_, Entry> {
    entry.write().unwrap_or_else(PoisonError::into_inner)
}
