//! Periodic reading source for sensor nodes.

use crate::config::ProducerConf;
use crate::controller::Controller;
use crate::models::Reading;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub trait ReadingSource: Send + 'static {
    /// Readings for one tick, published in order
    fn sample(&mut self) -> Vec<Reading>;
}

/// Uniform temperature in `[min, max]` rounded to two decimals, motion with a
/// fixed probability.
pub struct SimulatedSource {
    rng: StdRng,
    temperature_min: f64,
    temperature_max: f64,
    motion_probability: f64,
}

impl SimulatedSource {
    pub fn new(conf: &ProducerConf) -> Self {
        Self::with_rng(conf, StdRng::from_entropy())
    }

    pub fn seeded(conf: &ProducerConf, seed: u64) -> Self {
        Self::with_rng(conf, StdRng::seed_from_u64(seed))
    }

    fn with_rng(conf: &ProducerConf, rng: StdRng) -> Self {
        Self {
            rng,
            temperature_min: conf.temperature_min,
            temperature_max: conf.temperature_max.max(conf.temperature_min),
            motion_probability: conf.motion_probability.clamp(0.0, 1.0),
        }
    }
}

impl ReadingSource for SimulatedSource {
    fn sample(&mut self) -> Vec<Reading> {
        let raw = self.rng.gen_range(self.temperature_min..=self.temperature_max);
        let temperature = (raw * 100.0).round() / 100.0;
        let motion = self.rng.gen_bool(self.motion_probability);
        vec![Reading::Temperature(temperature), Reading::Motion(motion)]
    }
}

/// Feeds `source` into the controller every `period` until shutdown
pub fn spawn_producer<S: ReadingSource>(
    controller: Controller,
    mut source: S,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?period, "producer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for reading in source.sample() {
                        if let Err(e) = controller.ingest_local(reading) {
                            debug!(error = %e, ?reading, "reading not published");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("producer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BusHandle;
    use crate::envelope::EnvelopeCodec;
    use crate::events::{EventBroadcaster, KernelEvent};
    use crate::models::ControlConfig;
    use crate::router::TopicMap;
    use std::sync::Arc;

    #[test]
    fn test_simulated_values_stay_in_range() {
        let conf = ProducerConf { temperature_min: 20.0, temperature_max: 30.0, ..ProducerConf::default() };
        let mut source = SimulatedSource::seeded(&conf, 7);
        for _ in 0..200 {
            let readings = source.sample();
            let Reading::Temperature(t) = readings[0] else { panic!("temperature first") };
            assert!((20.0..=30.0).contains(&t), "{t}");
            assert_eq!((t * 100.0).round() / 100.0, t);
            assert!(matches!(readings[1], Reading::Motion(_)));
        }
    }

    #[test]
    fn test_motion_probability_extremes() {
        let never = ProducerConf { motion_probability: 0.0, ..ProducerConf::default() };
        let always = ProducerConf { motion_probability: 1.0, ..ProducerConf::default() };
        assert_eq!(SimulatedSource::seeded(&never, 1).sample()[1], Reading::Motion(false));
        assert_eq!(SimulatedSource::seeded(&always, 1).sample()[1], Reading::Motion(true));
    }

    struct Fixed(f64);

    impl ReadingSource for Fixed {
        fn sample(&mut self) -> Vec<Reading> {
            vec![Reading::Temperature(self.0)]
        }
    }

    #[tokio::test]
    async fn test_producer_feeds_controller_until_shutdown() {
        let events = EventBroadcaster::new(32);
        let mut rx = events.subscribe();
        let controller = Controller::new(
            ControlConfig::default(),
            BusHandle::new(),
            events,
            Arc::new(EnvelopeCodec::plaintext()),
            TopicMap::default(),
        );
        let (tx, shutdown) = watch::channel(false);
        let handle = spawn_producer(controller.clone(), Fixed(22.5), Duration::from_millis(10), shutdown);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, KernelEvent::TemperatureObserved { value: 22.5 });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(controller.snapshot().last_temperature, Some(22.5));
    }
}
