//! [`AggregateSensor`]: a sensor whose value is a function of a dynamic [`crate::sensor::SensorSet`].
//!
//! Modeled on `aiokatcp`'s aggregate sensors (see e.g. the `Total` sensor in a katcp device's
//! example server, which sums a filtered set of integer sensors): an aggregate sensor attaches to
//! every member of a target set matching a filter predicate, recomputes on every add, remove, or
//! member value change, and writes the result as its own reading.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use crate::{
    messages::sensors::Status,
    prelude::*,
    sensor::{AnySensor, ObserverId, Reading, Sensor, SensorSet, SensorSetEvent, SensorValue},
};

/// The event that triggered a recompute, passed to an [`AggregateSensor`]'s compute function
/// alongside a snapshot of the current filtered membership.
pub enum AggregateEvent<'a> {
    /// Constructed at aggregate-creation time, before any per-member events have been observed.
    Init,
    Added {
        sensor: &'a Arc<dyn AnySensor>,
        new_reading: &'a Reading<Vec<u8>>,
    },
    Removed {
        sensor: &'a Arc<dyn AnySensor>,
        old_reading: &'a Reading<Vec<u8>>,
    },
    Changed {
        sensor: &'a Arc<dyn AnySensor>,
        new_reading: &'a Reading<Vec<u8>>,
        old_reading: &'a Reading<Vec<u8>>,
    },
}

type ComputeFn<T> =
    dyn Fn(AggregateEvent<'_>, &[(Arc<dyn AnySensor>, Reading<Vec<u8>>)]) -> (T, Status)
        + Send
        + Sync;

struct MemberEntry {
    sensor: Arc<dyn AnySensor>,
    reading: Reading<Vec<u8>>,
    observer_id: ObserverId,
}

struct Shared<T: SensorValue> {
    sensor: Sensor<T>,
    members: Mutex<HashMap<String, MemberEntry>>,
    filter: Box<dyn Fn(&dyn AnySensor) -> bool + Send + Sync>,
    compute: Box<ComputeFn<T>>,
}

impl<T: SensorValue> Shared<T> {
    fn snapshot(&self) -> Vec<(Arc<dyn AnySensor>, Reading<Vec<u8>>)> {
        self.members
            .lock()
            .unwrap()
            .values()
            .map(|m| (m.sensor.clone(), m.reading.clone()))
            .collect()
    }

    fn recompute(&self, event: AggregateEvent<'_>) {
        let snapshot = self.snapshot();
        let (value, status) = (self.compute)(event, &snapshot);
        self.sensor.set_value(value, status, KatcpTimestamp::now());
    }

    fn add_member(self: &Arc<Self>, sensor: Arc<dyn AnySensor>, notify: bool) {
        if !(self.filter)(sensor.as_ref()) {
            return;
        }
        let name = sensor.name().to_owned();
        let initial = sensor.current_reading();
        {
            let mut members = self.members.lock().unwrap();
            members.insert(
                name.clone(),
                MemberEntry {
                    sensor: sensor.clone(),
                    reading: initial.clone(),
                    observer_id: 0,
                },
            );
        }
        let shared = self.clone();
        let observed_sensor = sensor.clone();
        let observed_name = name.clone();
        let observer_id = sensor.attach_raw(Box::new(move |reading| {
            shared.handle_member_reading(&observed_name, &observed_sensor, reading.clone());
        }));
        self.members.lock().unwrap().get_mut(&name).unwrap().observer_id = observer_id;
        if notify {
            self.recompute(AggregateEvent::Added {
                sensor: &sensor,
                new_reading: &initial,
            });
        }
    }

    fn remove_member(self: &Arc<Self>, sensor: &Arc<dyn AnySensor>) {
        let name = sensor.name().to_owned();
        let removed = self.members.lock().unwrap().remove(&name);
        if let Some(entry) = removed {
            sensor.detach(entry.observer_id);
            self.recompute(AggregateEvent::Removed {
                sensor,
                old_reading: &entry.reading,
            });
        }
    }

    fn handle_member_reading(
        self: &Arc<Self>,
        name: &str,
        sensor: &Arc<dyn AnySensor>,
        reading: Reading<Vec<u8>>,
    ) {
        let old = {
            let mut members = self.members.lock().unwrap();
            match members.get_mut(name) {
                Some(entry) => {
                    let old = entry.reading.clone();
                    entry.reading = reading.clone();
                    old
                }
                None => return,
            }
        };
        if old == reading {
            return;
        }
        self.recompute(AggregateEvent::Changed {
            sensor,
            new_reading: &reading,
            old_reading: &old,
        });
    }
}

/// A sensor whose reading is recomputed from a filtered, dynamic [`SensorSet`].
pub struct AggregateSensor<T: SensorValue> {
    sensor: Sensor<T>,
    set: SensorSet,
    set_observer_id: ObserverId,
    shared: Arc<Shared<T>>,
}

impl<T: SensorValue> AggregateSensor<T> {
    /// Builds an aggregate sensor over `set`, filtered by `filter`, computed by `compute`.
    /// `filter` should exclude the aggregate's own sensor if it ever appears in `set` -- this is
    /// also enforced automatically by name, breaking the observer cycle an aggregate sensor
    /// living in the set it observes would otherwise create.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        units: impl Into<String>,
        set: SensorSet,
        filter: impl Fn(&dyn AnySensor) -> bool + Send + Sync + 'static,
        compute: impl Fn(AggregateEvent<'_>, &[(Arc<dyn AnySensor>, Reading<Vec<u8>>)]) -> (T, Status)
            + Send
            + Sync
            + 'static,
        initial: T,
    ) -> Self {
        let sensor = Sensor::new(name, description, units, Status::Unknown, initial);
        let shared = Arc::new(Shared {
            sensor: sensor.clone(),
            members: Mutex::new(HashMap::new()),
            filter: Box::new(filter),
            compute: Box::new(compute),
        });

        let agg_name = sensor.name().to_owned();
        for member in set.snapshot() {
            if member.name() == agg_name {
                continue;
            }
            shared.add_member(member, false);
        }
        shared.recompute(AggregateEvent::Init);

        let shared_for_events = shared.clone();
        let agg_name_for_events = agg_name;
        let set_observer_id = set.attach(move |event| match event {
            SensorSetEvent::Added(s) => {
                if s.name() != agg_name_for_events {
                    shared_for_events.add_member(s.clone(), true);
                }
            }
            SensorSetEvent::Removed(s) => shared_for_events.remove_member(s),
        });

        Self {
            sensor,
            set,
            set_observer_id,
            shared,
        }
    }

    pub fn sensor(&self) -> &Sensor<T> {
        &self.sensor
    }
}

impl<T: SensorValue> Drop for AggregateSensor<T> {
    fn drop(&mut self) {
        self.set.detach(self.set_observer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_compute(
        _event: AggregateEvent<'_>,
        members: &[(Arc<dyn AnySensor>, Reading<Vec<u8>>)],
    ) -> (i64, Status) {
        let sum = members
            .iter()
            .filter_map(|(_, reading)| i64::from_argument(&reading.value).ok())
            .sum();
        (sum, Status::Nominal)
    }

    #[test]
    fn aggregate_closure_over_add_update_remove() {
        let set = SensorSet::new();
        let a = Arc::new(Sensor::new("a", "", "", Status::Nominal, 1i64));
        let b = Arc::new(Sensor::new("b", "", "", Status::Nominal, 2i64));
        set.add(a.clone());
        set.add(b.clone());

        let aggregate = AggregateSensor::new(
            "total",
            "sum of a and b",
            "",
            set.clone(),
            |_| true,
            sum_compute,
            0i64,
        );
        assert_eq!(aggregate.sensor().reading().value, 3);

        a.set_value(10, Status::Nominal, KatcpTimestamp::now());
        assert_eq!(aggregate.sensor().reading().value, 12);

        let c = Arc::new(Sensor::new("c", "", "", Status::Nominal, 5i64));
        set.add(c);
        assert_eq!(aggregate.sensor().reading().value, 17);

        set.remove("b");
        assert_eq!(aggregate.sensor().reading().value, 15);
    }

    #[test]
    fn aggregate_excludes_itself_from_its_own_set() {
        let set = SensorSet::new();
        let a = Arc::new(Sensor::new("a", "", "", Status::Nominal, 1i64));
        set.add(a);

        // `total` lives in the same set it aggregates over; it must not count itself.
        let aggregate = AggregateSensor::new(
            "total", "", "", set.clone(), |_| true, sum_compute, 0i64,
        );
        set.add(Arc::new(aggregate.sensor().clone()) as Arc<dyn AnySensor>);
        assert_eq!(aggregate.sensor().reading().value, 1);
    }
}
