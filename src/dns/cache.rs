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
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dns::message::has_answers;
use crate::dns::name_util::canonical;

/// How often expired entries are swept, regardless of access.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Lifetime of a failed or empty answer.
pub const NEGATIVE_TTL: Duration = Duration::from_secs(5);

/// Identifies a cached answer. Names are compared in their lower-cased FQDN form.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct QuestionKey {
    name: Name,
    record_type: RecordType,
    class: DNSClass,
}

impl From<&Query> for QuestionKey {
    fn from(query: &Query) -> Self {
        Self {
            name: canonical(query.name()),
            record_type: query.query_type(),
            class: query.query_class(),
        }
    }
}

struct Entry {
    message: Message,
    expires_at: Instant,
}

impl Entry {
    fn is_valid(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

type Entries = Arc<Mutex<HashMap<QuestionKey, Entry>>>;

/// A short-lived cache of upstream answers, keyed by question.
///
/// Entries expire after the minimum TTL of their answers, or [NEGATIVE_TTL] for answers that
/// failed or carried no records. Expired entries are removed lazily by [AnswerCache::get] and
/// periodically by a sweep task controlled with [AnswerCache::start] and [AnswerCache::close].
pub struct AnswerCache {
    entries: Entries,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl Default for AnswerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AnswerCache {
    pub fn new() -> Self {
        Self {
            entries: Default::default(),
            sweeper: Mutex::new(None),
        }
    }

    /// Stores the message under its first question. Messages without a question are ignored.
    ///
    /// A failed or empty answer never replaces an entry that is still valid and has answers,
    /// so a transient upstream failure cannot flush a good answer.
    pub fn set(&self, msg: &Message) {
        let Some(question) = msg.queries().first() else {
            return;
        };
        let key = QuestionKey::from(question);
        let now = Instant::now();

        let mut entries = lock(&self.entries);
        if !has_answers(msg)
            && let Some(existing) = entries.get(&key)
            && existing.is_valid(now)
            && has_answers(&existing.message)
        {
            debug!(name=%key.name, query=%key.record_type, "keeping cached answer over empty response");
            return;
        }

        entries.insert(
            key,
            Entry {
                message: msg.clone(),
                expires_at: now + ttl(msg),
            },
        );
    }

    /// Returns the cached answer for the question, if it has not expired.
    pub fn get(&self, question: &Query) -> Option<Message> {
        let key = QuestionKey::from(question);
        let now = Instant::now();

        let mut entries = lock(&self.entries);
        match entries.get(&key) {
            Some(entry) if entry.is_valid(now) => Some(entry.message.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Removes every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        purge(&self.entries, Instant::now())
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts the background sweep. Calling this more than once has no effect.
    pub fn start(&self) {
        let mut sweeper = lock(&self.sweeper);
        if sweeper.is_some() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("no async runtime available, answer cache sweep is disabled");
            return;
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let entries = self.entries.clone();
        handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = purge(&entries, Instant::now());
                        if removed > 0 {
                            debug!(removed, "swept expired answers");
                        }
                    }
                }
            }
        });
        info!(interval=?SWEEP_INTERVAL, "answer cache sweep started");
        *sweeper = Some(cancel);
    }

    /// Stops the background sweep. Safe to call without a prior [AnswerCache::start].
    pub fn close(&self) {
        if let Some(cancel) = lock(&self.sweeper).take() {
            cancel.cancel();
            info!("answer cache sweep stopped");
        }
    }
}

impl Drop for AnswerCache {
    fn drop(&mut self) {
        self.close();
    }
}

/// Computes how long the message may be cached.
pub fn ttl(msg: &Message) -> Duration {
    if !has_answers(msg) {
        return NEGATIVE_TTL;
    }
    msg.answers()
        .iter()
        .map(|record| record.ttl())
        .min()
        .map(|secs| Duration::from_secs(secs.into()))
        .unwrap_or(NEGATIVE_TTL)
}

fn purge(entries: &Entries, now: Instant) -> usize {
    let mut entries = lock(entries);
    let before = entries.len();
    entries.retain(|_, entry| entry.is_valid(now));
    before - entries.len()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record};

    use super::*;
    use crate::dns::message::{addresses, error_reply, reply_to};
    use crate::test_helpers::dns::{ipv4, n, new_message};

    fn answer(host: &str, ttls: &[u32]) -> Message {
        let req = new_message(n(host), RecordType::A);
        let mut reply = reply_to(&req);
        for (i, ttl) in ttls.iter().enumerate() {
            let addr = std::net::Ipv4Addr::new(10, 0, 0, i as u8 + 1);
            reply.add_answer(Record::from_rdata(n(host), *ttl, RData::A(A(addr))));
        }
        reply
    }

    fn question(host: &str) -> Query {
        Query::query(n(host), RecordType::A)
    }

    #[test]
    fn ttl_is_minimum_of_answers() {
        assert_eq!(
            Duration::from_secs(120),
            ttl(&answer("www.example.com.", &[300, 120, 600]))
        );
    }

    #[test]
    fn ttl_for_negative_answers() {
        let req = new_message(n("nope.example.com."), RecordType::A);
        assert_eq!(NEGATIVE_TTL, ttl(&error_reply(&req, ResponseCode::NXDomain)));
        assert_eq!(NEGATIVE_TTL, ttl(&answer("www.example.com.", &[])));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_min_ttl() {
        let cache = AnswerCache::new();
        cache.set(&answer("www.example.com.", &[300, 120, 600]));

        tokio::time::advance(Duration::from_secs(119)).await;
        let cached = cache.get(&question("www.example.com.")).unwrap();
        assert_eq!(3, cached.answers().len());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&question("www.example.com.")).is_none());
        // The expired entry is dropped on read.
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nxdomain_expires_after_negative_ttl() {
        let cache = AnswerCache::new();
        let req = new_message(n("nope.example.com."), RecordType::A);
        cache.set(&error_reply(&req, ResponseCode::NXDomain));

        tokio::time::advance(Duration::from_secs(4)).await;
        let cached = cache.get(&question("nope.example.com.")).unwrap();
        assert_eq!(ResponseCode::NXDomain, cached.response_code());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&question("nope.example.com.")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_answer_does_not_replace_valid_entry() {
        let cache = AnswerCache::new();
        cache.set(&answer("www.example.com.", &[60]));

        let req = new_message(n("www.example.com."), RecordType::A);
        cache.set(&error_reply(&req, ResponseCode::ServFail));
        cache.set(&answer("www.example.com.", &[]));

        let cached = cache.get(&question("www.example.com.")).unwrap();
        assert_eq!(ResponseCode::NoError, cached.response_code());
        assert_eq!(vec![IpAddr::V4(ipv4("10.0.0.1"))], addresses(&cached));

        // Once the good entry expired, the negative answer is accepted.
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.set(&error_reply(&req, ResponseCode::ServFail));
        let cached = cache.get(&question("www.example.com.")).unwrap();
        assert_eq!(ResponseCode::ServFail, cached.response_code());
    }

    #[test]
    fn newer_answer_replaces_entry() {
        let cache = AnswerCache::new();
        cache.set(&answer("www.example.com.", &[60]));
        cache.set(&answer("www.example.com.", &[60, 60]));
        assert_eq!(1, cache.len());
        let cached = cache.get(&question("www.example.com.")).unwrap();
        assert_eq!(2, cached.answers().len());
    }

    #[test]
    fn question_is_case_insensitive() {
        let cache = AnswerCache::new();
        cache.set(&answer("WWW.Example.COM.", &[60]));
        assert!(cache.get(&question("www.example.com.")).is_some());
        assert!(cache.get(&question("www.example.com")).is_some());
        assert!(
            cache
                .get(&Query::query(n("www.example.com."), RecordType::AAAA))
                .is_none()
        );
    }

    #[test]
    fn message_without_question_is_ignored() {
        let cache = AnswerCache::new();
        cache.set(&Message::new());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_entries() {
        let cache = AnswerCache::new();
        cache.start();
        // Starting twice is a no-op.
        cache.start();

        cache.set(&answer("short.example.com.", &[10]));
        cache.set(&answer("long.example.com.", &[600]));
        assert_eq!(2, cache.len());

        // The sweeper ticks at 30s without anyone reading.
        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(1, cache.len());

        cache.close();
        cache.close();
    }

    #[test]
    fn close_without_start() {
        let cache = AnswerCache::new();
        cache.close();
        // No runtime here, so start is a logged no-op.
        cache.start();
        cache.close();
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired() {
        let cache = AnswerCache::new();
        cache.set(&answer("short.example.com.", &[10]));
        cache.set(&answer("long.example.com.", &[600]));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(1, cache.purge_expired());
        assert_eq!(1, cache.len());
    }
}
