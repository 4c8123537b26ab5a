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

use std::fmt::Write;
use std::marker::PhantomData;
use std::mem;

use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};
use prometheus_client::registry::Registry;
use tracing::error;

/// Prefix of every metric registered by this crate.
pub const PREFIX: &str = "dnscore";

/// Returns the sub registry that metrics of this crate are registered in.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
    registry.sub_registry_with_prefix(PREFIX)
}

pub trait Recorder<E, T> {
    /// Record the given event
    fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
    /// Record the given event by incrementing the counter by count
    fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
    R: Recorder<E, u64>,
{
    fn increment(&self, event: &E) {
        self.record(event, 1);
    }
}

/// Records events once a returned guard is dropped.
pub trait DeferRecorder {
    #[must_use = "metric will be dropped (and thus recorded) immediately if not assigned"]
    /// Perform a record operation on this object when the returned [Deferred] object is
    /// dropped.
    fn defer_record<'a, F>(&'a self, record: F) -> Deferred<'a, F, Self>
    where
        F: FnOnce(&'a Self),
        Self: Sized,
    {
        Deferred::new(self, record)
    }
}

pub struct Deferred<'a, F, T>
where
    F: FnOnce(&'a T),
    T: ?Sized,
{
    param: &'a T,
    deferred_fn: Option<F>,
    _lifetime: PhantomData<&'a F>,
}

impl<'a, F, T> Deferred<'a, F, T>
where
    F: FnOnce(&'a T),
    T: ?Sized,
{
    pub fn new(param: &'a T, deferred_fn: F) -> Self {
        Self {
            param,
            deferred_fn: Some(deferred_fn),
            _lifetime: PhantomData,
        }
    }
}

impl<'a, F, T> Drop for Deferred<'a, F, T>
where
    F: FnOnce(&'a T),
    T: ?Sized,
{
    fn drop(&mut self) {
        if let Some(deferred_fn) = mem::take(&mut self.deferred_fn) {
            (deferred_fn)(self.param);
        } else {
            error!("defer deferred record failed, event is gone");
        }
    }
}

#[derive(Default, Hash, PartialEq, Eq, Clone, Debug)]
// DefaultedUnknown is a wrapper around an Option that encodes as "unknown" when missing, rather than ""
pub struct DefaultedUnknown<T>(Option<T>);

impl From<String> for DefaultedUnknown<String> {
    fn from(t: String) -> Self {
        if t.is_empty() {
            DefaultedUnknown(None)
        } else {
            DefaultedUnknown(Some(t))
        }
    }
}

impl<T> From<Option<T>> for DefaultedUnknown<T> {
    fn from(t: Option<T>) -> Self {
        DefaultedUnknown(t)
    }
}

impl<T: EncodeLabelValue> EncodeLabelValue for DefaultedUnknown<T> {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        match self {
            DefaultedUnknown(Some(i)) => i.encode(writer),
            DefaultedUnknown(None) => writer.write_str("unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counting(AtomicU64);

    struct Event;

    impl Recorder<Event, u64> for Counting {
        fn record(&self, _: &Event, count: u64) {
            self.0.fetch_add(count, Ordering::SeqCst);
        }
    }

    impl DeferRecorder for Counting {}

    #[test]
    fn deferred_records_on_drop() {
        let counter = Counting(AtomicU64::new(0));
        counter.increment(&Event);
        {
            let _guard = counter.defer_record(|c| c.increment(&Event));
            assert_eq!(1, counter.0.load(Ordering::SeqCst));
        }
        assert_eq!(2, counter.0.load(Ordering::SeqCst));
    }

    #[test]
    fn defaulted_unknown() {
        assert_eq!(DefaultedUnknown(None), DefaultedUnknown::from(String::new()));
        assert_eq!(
            DefaultedUnknown(Some("udp".to_string())),
            DefaultedUnknown::from("udp".to_string())
        );
    }
}
