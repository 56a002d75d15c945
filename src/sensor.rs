//! The observable, typed sensor model: [`Sensor<T>`], the type-erased [`AnySensor`] trait that
//! lets heterogeneous sensors live together in a [`SensorSet`], and the set itself.
//!
//! A device exposes many sensors of different host types (a boolean enable line, a float
//! temperature, a discrete mode) under one `?sensor-list`/`?sensor-value` surface. Rust's static
//! typing means a single `Sensor<T>` can't hold them all, so [`AnySensor`] is the object-safe
//! façade every concrete `Sensor<T>` implements, and [`SensorSet`] stores `Arc<dyn AnySensor>`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    messages::sensors::{ArgumentType, ArgumentVec, SensorListInform, Status},
    prelude::*,
};

/// A single observation: the value a sensor held, its health, and when it was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading<T> {
    pub timestamp: KatcpTimestamp,
    pub status: Status,
    pub value: T,
}

/// Host types that can back a [`Sensor`]. Implemented for the base katcp value types; a device
/// can add more by implementing this alongside [`ToKatcpArgument`].
pub trait SensorValue: ToKatcpArgument + Clone + PartialEq + Send + Sync + 'static {
    fn argument_type() -> ArgumentType;

    /// The optional nominal/warn range or discrete option list reported by `?sensor-list`.
    /// Sensors with interesting ranges should override this.
    fn list_params() -> ArgumentVec {
        ArgumentVec::Empty(Self::argument_type())
    }
}

impl SensorValue for i64 {
    fn argument_type() -> ArgumentType {
        ArgumentType::Integer
    }
}

impl SensorValue for f64 {
    fn argument_type() -> ArgumentType {
        ArgumentType::Float
    }
}

impl SensorValue for bool {
    fn argument_type() -> ArgumentType {
        ArgumentType::Boolean
    }
}

impl SensorValue for String {
    fn argument_type() -> ArgumentType {
        ArgumentType::String
    }
}

impl SensorValue for KatcpTimestamp {
    fn argument_type() -> ArgumentType {
        ArgumentType::Timestamp
    }
}

impl SensorValue for KatcpAddress {
    fn argument_type() -> ArgumentType {
        ArgumentType::Address
    }
}

/// Identifies an observer previously returned by [`Sensor::attach`], for use with
/// [`Sensor::detach`].
pub type ObserverId = u64;

type Observer<T> = Box<dyn FnMut(&Reading<T>) + Send>;
/// A type-erased observer, receiving the sensor's wire-encoded value alongside its status and
/// timestamp. Used by [`AnySensor::attach_raw`], e.g. by samplers that don't know a sensor's
/// host type at compile time.
pub type RawObserver = Box<dyn FnMut(&Reading<Vec<u8>>) + Send>;

struct SensorInner<T> {
    description: String,
    units: String,
    reading: Reading<T>,
    observers: Vec<(ObserverId, Observer<T>)>,
    next_observer_id: ObserverId,
}

/// A named, typed observable value with a status and timestamp.
///
/// Cloning a `Sensor` clones the handle, not the underlying state -- all clones observe and
/// mutate the same cell, which is how a [`SensorSet`], a [`crate::sampler::Sampler`], and an
/// [`crate::aggregate::AggregateSensor`] can share one sensor.
#[derive(Clone)]
pub struct Sensor<T: SensorValue> {
    name: Arc<str>,
    inner: Arc<Mutex<SensorInner<T>>>,
}

impl<T: SensorValue> Sensor<T> {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        units: impl Into<String>,
        status: Status,
        value: T,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            inner: Arc::new(Mutex::new(SensorInner {
                description: description.into(),
                units: units.into(),
                reading: Reading {
                    timestamp: KatcpTimestamp::now(),
                    status,
                    value,
                },
                observers: Vec::new(),
                next_observer_id: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reading(&self) -> Reading<T> {
        self.inner.lock().unwrap().reading.clone()
    }

    pub fn status(&self) -> Status {
        self.inner.lock().unwrap().reading.status
    }

    pub fn last_updated(&self) -> KatcpTimestamp {
        self.inner.lock().unwrap().reading.timestamp
    }

    /// Updates the reading. Notifies observers iff the value changed, the status changed, or
    /// `timestamp` is newer than the previously held reading -- and in that case the timestamp
    /// delivered is always the newer of the two, preserving monotonicity across observers.
    pub fn set_value(&self, value: T, status: Status, timestamp: KatcpTimestamp) {
        let mut inner = self.inner.lock().unwrap();
        let newer = timestamp.0 > inner.reading.timestamp.0;
        let changed = inner.reading.value != value || inner.reading.status != status || newer;
        if !changed {
            return;
        }
        let timestamp = if newer { timestamp } else { inner.reading.timestamp };
        inner.reading = Reading {
            timestamp,
            status,
            value,
        };
        let reading = inner.reading.clone();
        for (_, observer) in inner.observers.iter_mut() {
            observer(&reading);
        }
    }

    /// Attaches an observer, which is invoked immediately with the current reading (per the
    /// "attach delivers a current-reading callback first" invariant), then again on every future
    /// change. Returns an id for [`Sensor::detach`].
    pub fn attach(&self, mut observer: impl FnMut(&Reading<T>) + Send + 'static) -> ObserverId {
        let mut inner = self.inner.lock().unwrap();
        observer(&inner.reading);
        let id = inner.next_observer_id;
        inner.next_observer_id += 1;
        inner.observers.push((id, Box::new(observer)));
        id
    }

    /// Detaches a previously attached observer. Idempotent: detaching an id more than once, or
    /// one that was never attached, is a no-op.
    pub fn detach(&self, id: ObserverId) {
        self.inner.lock().unwrap().observers.retain(|(oid, _)| *oid != id);
    }

    pub fn list_inform(&self) -> SensorListInform {
        let inner = self.inner.lock().unwrap();
        SensorListInform {
            name: self.name.to_string(),
            description: inner.description.clone(),
            units: inner.units.clone(),
            params: T::list_params(),
        }
    }
}

/// The object-safe façade [`Sensor<T>`] implements, so sensors of different host types can share
/// a [`SensorSet`].
pub trait AnySensor: Send + Sync {
    fn name(&self) -> &str;
    fn status(&self) -> Status;
    fn last_updated(&self) -> KatcpTimestamp;
    fn encoded_value(&self) -> Vec<u8>;
    fn list_inform(&self) -> SensorListInform;
    fn attach_raw(&self, observer: RawObserver) -> ObserverId;
    fn detach(&self, id: ObserverId);

    /// The current reading, wire-encoded. A convenience built from the methods above, for
    /// callers (e.g. [`crate::aggregate::AggregateSensor`]) that want a snapshot without
    /// attaching an observer.
    fn current_reading(&self) -> Reading<Vec<u8>> {
        Reading {
            timestamp: self.last_updated(),
            status: self.status(),
            value: self.encoded_value(),
        }
    }
}

impl<T: SensorValue> AnySensor for Sensor<T> {
    fn name(&self) -> &str {
        self.name()
    }

    fn status(&self) -> Status {
        self.status()
    }

    fn last_updated(&self) -> KatcpTimestamp {
        self.last_updated()
    }

    fn encoded_value(&self) -> Vec<u8> {
        self.reading().value.to_argument()
    }

    fn list_inform(&self) -> SensorListInform {
        self.list_inform()
    }

    fn attach_raw(&self, mut observer: RawObserver) -> ObserverId {
        self.attach(move |reading| {
            observer(&Reading {
                timestamp: reading.timestamp,
                status: reading.status,
                value: reading.value.to_argument(),
            })
        })
    }

    fn detach(&self, id: ObserverId) {
        Sensor::detach(self, id)
    }
}

/// An event delivered to a [`SensorSet`] observer.
pub enum SensorSetEvent {
    Added(Arc<dyn AnySensor>),
    Removed(Arc<dyn AnySensor>),
}

type SetObserver = Box<dyn FnMut(&SensorSetEvent) + Send>;

struct SensorSetInner {
    order: Vec<String>,
    sensors: HashMap<String, Arc<dyn AnySensor>>,
    observers: Vec<(ObserverId, SetObserver)>,
    next_observer_id: ObserverId,
}

/// An ordered `name -> sensor` mapping, preserving insertion order for `?sensor-list`, with
/// add/remove notifications for [`crate::aggregate::AggregateSensor`].
#[derive(Clone)]
pub struct SensorSet {
    inner: Arc<Mutex<SensorSetInner>>,
}

impl Default for SensorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SensorSetInner {
                order: Vec::new(),
                sensors: HashMap::new(),
                observers: Vec::new(),
                next_observer_id: 0,
            })),
        }
    }

    /// Registers a sensor under its own name, replacing any existing sensor of the same name.
    pub fn add(&self, sensor: Arc<dyn AnySensor>) {
        let mut inner = self.inner.lock().unwrap();
        let name = sensor.name().to_owned();
        if !inner.sensors.contains_key(&name) {
            inner.order.push(name.clone());
        }
        inner.sensors.insert(name, sensor.clone());
        for (_, observer) in inner.observers.iter_mut() {
            observer(&SensorSetEvent::Added(sensor.clone()));
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn AnySensor>> {
        let mut inner = self.inner.lock().unwrap();
        let sensor = inner.sensors.remove(name)?;
        inner.order.retain(|n| n != name);
        for (_, observer) in inner.observers.iter_mut() {
            observer(&SensorSetEvent::Removed(sensor.clone()));
        }
        Some(sensor)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnySensor>> {
        self.inner.lock().unwrap().sensors.get(name).cloned()
    }

    /// The current members, in insertion order. Used by an [`crate::aggregate::AggregateSensor`]
    /// to initialize its reading over the current membership before it starts observing changes.
    pub fn snapshot(&self) -> Vec<Arc<dyn AnySensor>> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|name| inner.sensors.get(name).cloned())
            .collect()
    }

    /// Subscribes to future add/remove events. Does not replay the current membership; use
    /// [`SensorSet::snapshot`] for that.
    pub fn attach(&self, observer: impl FnMut(&SensorSetEvent) + Send + 'static) -> ObserverId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_observer_id;
        inner.next_observer_id += 1;
        inner.observers.push((id, Box::new(observer)));
        id
    }

    pub fn detach(&self, id: ObserverId) {
        self.inner.lock().unwrap().observers.retain(|(oid, _)| *oid != id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn attach_delivers_current_reading_first() {
        let sensor = Sensor::new("pump.pressure", "pressure", "kPa", Status::Nominal, 3.15f64);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        sensor.attach(move |reading| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            assert_eq!(reading.value, 3.15);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_value_notifies_on_change_only() {
        let sensor = Sensor::new("pump.pressure", "pressure", "kPa", Status::Nominal, 3.15f64);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        sensor.attach(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        sensor.set_value(3.15, Status::Nominal, KatcpTimestamp(1.0));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "a newer timestamp alone is a change");
        sensor.set_value(3.15, Status::Nominal, KatcpTimestamp(0.5));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "older timestamp, same value/status: no change");
        sensor.set_value(90.0, Status::Warn, KatcpTimestamp(0.5));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn detach_is_idempotent() {
        let sensor = Sensor::new("x", "x", "", Status::Nominal, true);
        let id = sensor.attach(|_| {});
        sensor.detach(id);
        sensor.detach(id);
    }

    #[test]
    fn sensor_set_preserves_insertion_order() {
        let set = SensorSet::new();
        set.add(Arc::new(Sensor::new("b", "", "", Status::Nominal, 1i64)));
        set.add(Arc::new(Sensor::new("a", "", "", Status::Nominal, 2i64)));
        let names: Vec<_> = set.snapshot().iter().map(|s| s.name().to_owned()).collect();
        assert_eq!(names, vec!["b".to_owned(), "a".to_owned()]);
    }

    #[test]
    fn sensor_set_notifies_add_and_remove() {
        let set = SensorSet::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        set.attach(move |event| {
            let label = match event {
                SensorSetEvent::Added(s) => format!("add:{}", s.name()),
                SensorSetEvent::Removed(s) => format!("remove:{}", s.name()),
            };
            events_clone.lock().unwrap().push(label);
        });
        set.add(Arc::new(Sensor::new("a", "", "", Status::Nominal, 1i64)));
        set.remove("a");
        assert_eq!(*events.lock().unwrap(), vec!["add:a".to_owned(), "remove:a".to_owned()]);
    }
}
