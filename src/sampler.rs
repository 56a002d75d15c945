//! Per-connection sensor sampling strategies.
//!
//! A [`Sampler`] binds one sensor to one `?sensor-sampling` strategy for one client connection,
//! turning the sensor's observer stream into the schedule of `#sensor-status` informs that
//! strategy describes. Installing a sampler always reports the sensor's current reading first
//! (the same "attach replays current state" contract [`crate::sensor::Sensor::attach`] gives any
//! observer), then follows the strategy's own cadence.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    messages::sensors::{SamplingStrategy, Status},
    sensor::{AnySensor, ObserverId, Reading},
};

/// A live sampling strategy bound to a sensor. Dropping it detaches its observer and aborts its
/// background task (if any), so a client disconnecting or un-sampling a sensor costs nothing
/// more than dropping its `Sampler`s.
pub struct Sampler {
    sensor: Arc<dyn AnySensor>,
    strategy: SamplingStrategy,
    observer_id: Option<ObserverId>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Sampler {
    pub fn strategy(&self) -> &SamplingStrategy {
        &self.strategy
    }

    /// Installs `strategy` on `sensor`, calling `emit` for every `#sensor-status` update the
    /// strategy produces.
    pub fn install(
        sensor: Arc<dyn AnySensor>,
        strategy: SamplingStrategy,
        mut emit: impl FnMut(Reading<Vec<u8>>) + Send + 'static,
    ) -> Self {
        match strategy {
            SamplingStrategy::None => Self {
                sensor,
                strategy,
                observer_id: None,
                task: None,
            },
            SamplingStrategy::Auto => {
                let id = sensor.attach_raw(Box::new(move |reading| emit(reading.clone())));
                Self {
                    sensor,
                    strategy,
                    observer_id: Some(id),
                    task: None,
                }
            }
            SamplingStrategy::Event => {
                let mut last: Option<(Vec<u8>, Status)> = None;
                let id = sensor.attach_raw(Box::new(move |reading| {
                    let changed = !matches!(&last, Some((v, s)) if *v == reading.value && *s == reading.status);
                    if changed {
                        last = Some((reading.value.clone(), reading.status));
                        emit(reading.clone());
                    }
                }));
                Self {
                    sensor,
                    strategy,
                    observer_id: Some(id),
                    task: None,
                }
            }
            SamplingStrategy::Differential { difference } => {
                let difference = difference as f64;
                let mut last: Option<(f64, Status)> = None;
                let id = sensor.attach_raw(Box::new(move |reading| {
                    if significant_change(&reading, &mut last, difference) {
                        emit(reading.clone());
                    }
                }));
                Self {
                    sensor,
                    strategy,
                    observer_id: Some(id),
                    task: None,
                }
            }
            SamplingStrategy::Period { period } => {
                let sensor_for_task = sensor.clone();
                let task = tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period_duration(period));
                    loop {
                        interval.tick().await;
                        emit(sensor_for_task.current_reading());
                    }
                });
                Self {
                    sensor,
                    strategy,
                    observer_id: None,
                    task: Some(task),
                }
            }
            SamplingStrategy::EventRate {
                shortest_period,
                longest_period,
            } => Self::install_rated(
                sensor,
                strategy,
                shortest_period,
                longest_period,
                emit,
                None,
            ),
            SamplingStrategy::DifferentialRate {
                difference,
                shortest_period,
                longest_period,
            } => Self::install_rated(
                sensor,
                strategy,
                shortest_period,
                longest_period,
                emit,
                Some(difference as f64),
            ),
        }
    }

    /// Shared machinery for the two rate-limited strategies: an observer marks a reading
    /// "pending" whenever it's significant (any change for event-rate, a change clearing the
    /// differential threshold for differential-rate), and a background task drains that pending
    /// reading at most once per `shortest_period`, forcing a sample of the current reading if
    /// `longest_period` elapses with nothing pending.
    fn install_rated(
        sensor: Arc<dyn AnySensor>,
        strategy: SamplingStrategy,
        shortest_period: f32,
        longest_period: f32,
        mut emit: impl FnMut(Reading<Vec<u8>>) + Send + 'static,
        difference: Option<f64>,
    ) -> Self {
        let pending: Arc<Mutex<Option<Reading<Vec<u8>>>>> = Arc::new(Mutex::new(None));
        let last_compare: Arc<Mutex<Option<(f64, Status)>>> = Arc::new(Mutex::new(None));

        let pending_for_observer = pending.clone();
        let last_compare_for_observer = last_compare.clone();
        let observer_id = sensor.attach_raw(Box::new(move |reading| {
            let significant = match difference {
                Some(threshold) => {
                    let mut last = last_compare_for_observer.lock().unwrap();
                    significant_change(reading, &mut last, threshold)
                }
                None => true,
            };
            if significant {
                *pending_for_observer.lock().unwrap() = Some(reading.clone());
            }
        }));

        let sensor_for_task = sensor.clone();
        let tick = period_duration(shortest_period);
        let longest = Duration::from_secs_f32(longest_period.max(shortest_period).max(0.001));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            let mut since_last = Duration::ZERO;
            loop {
                interval.tick().await;
                since_last += tick;
                let due = pending.lock().unwrap().take();
                match due {
                    Some(reading) => {
                        emit(reading);
                        since_last = Duration::ZERO;
                    }
                    None if since_last >= longest => {
                        emit(sensor_for_task.current_reading());
                        since_last = Duration::ZERO;
                    }
                    None => {}
                }
            }
        });

        Self {
            sensor,
            strategy,
            observer_id: Some(observer_id),
            task: Some(task),
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Some(id) = self.observer_id.take() {
            self.sensor.detach(id);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn period_duration(period: f32) -> Duration {
    Duration::from_secs_f32(period.max(0.001))
}

/// True if `reading` differs from `*last` by at least `difference`, or carries a different
/// status; always true the first time (`*last` is `None`). Updates `*last` when the value parses.
fn significant_change(
    reading: &Reading<Vec<u8>>,
    last: &mut Option<(f64, Status)>,
    difference: f64,
) -> bool {
    let parsed = std::str::from_utf8(&reading.value)
        .ok()
        .and_then(|s| s.parse::<f64>().ok());
    let significant = match (parsed, &*last) {
        (Some(v), Some((lv, ls))) => (v - lv).abs() >= difference || reading.status != *ls,
        _ => true,
    };
    if let Some(v) = parsed {
        *last = Some((v, reading.status));
    }
    significant
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::Sensor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn none_strategy_never_emits() {
        let sensor = Arc::new(Sensor::new("x", "", "", Status::Nominal, 1i64));
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sampler = Sampler::install(sensor.clone(), SamplingStrategy::None, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        sensor.set_value(2, Status::Nominal, crate::types::KatcpTimestamp::now());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_strategy_replays_then_follows_every_change() {
        let sensor = Arc::new(Sensor::new("x", "", "", Status::Nominal, 1i64));
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sampler = Sampler::install(sensor.clone(), SamplingStrategy::Auto, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1, "install replays the current reading");
        sensor.set_value(2, Status::Nominal, crate::types::KatcpTimestamp::now());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn differential_strategy_ignores_small_changes() {
        let sensor = Arc::new(Sensor::new("x", "", "", Status::Nominal, 10.0f64));
        let readings = Arc::new(Mutex::new(Vec::new()));
        let readings_clone = readings.clone();
        let _sampler = Sampler::install(
            sensor.clone(),
            SamplingStrategy::Differential { difference: 5.0 },
            move |reading| readings_clone.lock().unwrap().push(reading),
        );
        sensor.set_value(12.0, Status::Nominal, crate::types::KatcpTimestamp::now());
        sensor.set_value(16.0, Status::Nominal, crate::types::KatcpTimestamp::now());
        let values: Vec<_> = readings
            .lock()
            .unwrap()
            .iter()
            .map(|r| String::from_utf8_lossy(&r.value).to_string())
            .collect();
        assert_eq!(values, vec!["10".to_owned(), "16".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn period_strategy_fires_on_a_fixed_cadence() {
        let sensor = Arc::new(Sensor::new("x", "", "", Status::Nominal, 1i64));
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sampler = Sampler::install(
            sensor,
            SamplingStrategy::Period { period: 1.0 },
            move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
        tokio::time::advance(Duration::from_millis(2500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
