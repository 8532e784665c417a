//! Cyclic scheduler
//!
//! Sends every periodic message at its own cadence. All messages share one
//! deadline queue: the loop sleeps until the earliest deadline, fires that
//! message (generate, encode, send), then re-arms it one period later. Only
//! one message fires at a time, so generator state and the bus need no
//! locking here.
//!
//! Deadlines advance additively (`deadline += period`), so time spent
//! generating and sending does not accumulate as drift. A fire that starts
//! more than one period late counts as a missed deadline and is handled by
//! the configured [`MissedDeadlinePolicy`].

use crate::bus::BusSession;
use crate::codec;
use crate::config::{MissedDeadlinePolicy, SimulatorConfig};
use crate::generator::{GeneratorState, LiveValueGenerator};
use crate::shutdown::{self, ShutdownReceiver};
use crate::signals::Catalog;
use crate::sink::EventSink;
use crate::types::{hex_string, BusEvent, CanFrame, SignalValues};
use chrono::Utc;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of one periodic message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Scheduler not started yet
    Idle,
    /// Waiting for its next deadline
    Armed,
    /// Generating, encoding or sending
    Firing,
}

/// Counters reported when the scheduler stops
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub frames_sent: u64,
    pub send_failures: u64,
    pub encode_failures: u64,
    pub missed_deadlines: u64,
}

/// Next deadline of a message that was due at `deadline`
///
/// `started` and `finished` bracket the fire. Returns the new deadline and
/// whether the fire missed its deadline by more than one period.
pub fn next_deadline(
    policy: MissedDeadlinePolicy,
    deadline: Instant,
    period: Duration,
    started: Instant,
    finished: Instant,
) -> (Instant, bool) {
    let missed = started.saturating_duration_since(deadline) > period;
    let next = match (missed, policy) {
        (true, MissedDeadlinePolicy::Realign) => finished + period,
        _ => deadline + period,
    };
    (next, missed)
}

struct Slot {
    /// Index into `Catalog::messages()`
    message_index: usize,
    period: Duration,
    state: MessageState,
    next_deadline: Option<Instant>,
    cycle: u64,
    values: GeneratorState,
}

pub struct CyclicScheduler<B: BusSession + ?Sized, S: EventSink> {
    catalog: Arc<Catalog>,
    bus: Arc<B>,
    sink: S,
    generator: LiveValueGenerator,
    policy: MissedDeadlinePolicy,
    slots: Vec<Slot>,
    queue: BinaryHeap<Reverse<(Instant, usize)>>,
    started_at: Option<Instant>,
    stats: SchedulerStats,
}

impl<B: BusSession + ?Sized, S: EventSink> CyclicScheduler<B, S> {
    /// Create a scheduler for every message of `catalog` that has a period
    ///
    /// The period comes from the message definition, or from
    /// `config.default_cycle_time_ms` when the definition has none.
    pub fn new(catalog: Arc<Catalog>, bus: Arc<B>, sink: S, config: &SimulatorConfig) -> Self {
        let slots: Vec<Slot> = catalog
            .messages()
            .iter()
            .enumerate()
            .filter(|(_, message)| config.should_process_message(message.id))
            .filter_map(|(index, message)| {
                let period = config.cycle_time_for(message.cycle_time_ms)?;
                log::debug!(
                    "Scheduling {} (ID: 0x{:X}) every {}ms",
                    message.name,
                    message.id,
                    period.as_millis()
                );
                Some(Slot {
                    message_index: index,
                    period,
                    state: MessageState::Idle,
                    next_deadline: None,
                    cycle: 0,
                    values: GeneratorState::new(),
                })
            })
            .collect();

        Self {
            catalog,
            bus,
            sink,
            generator: LiveValueGenerator::from_config(config),
            policy: config.missed_deadline_policy,
            slots,
            queue: BinaryHeap::new(),
            started_at: None,
            stats: SchedulerStats::default(),
        }
    }

    /// Number of messages with a period
    pub fn scheduled_count(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// State of a scheduled message, `None` if it is not scheduled
    pub fn message_state(&self, message_name: &str) -> Option<MessageState> {
        self.slot(message_name).map(|slot| slot.state)
    }

    /// Next deadline of a scheduled message, relative to scheduler start
    pub fn next_deadline_of(&self, message_name: &str) -> Option<Duration> {
        let slot = self.slot(message_name)?;
        let started_at = self.started_at?;
        slot.next_deadline
            .map(|deadline| deadline.saturating_duration_since(started_at))
    }

    /// Merged copy of the last generated values, keyed by message name
    pub fn generator_snapshot(&self) -> BTreeMap<String, SignalValues> {
        self.slots
            .iter()
            .filter(|slot| !slot.values.is_empty())
            .map(|slot| {
                let name = self.catalog.messages()[slot.message_index].name.clone();
                (name, slot.values.values().clone())
            })
            .collect()
    }

    fn slot(&self, message_name: &str) -> Option<&Slot> {
        let messages = self.catalog.messages();
        self.slots
            .iter()
            .find(|slot| messages[slot.message_index].name == message_name)
    }

    /// Arm every scheduled message with its first deadline, one period after `now`
    ///
    /// Does nothing if the scheduler was already started.
    pub fn start(&mut self, now: Instant) {
        if self.started_at.is_some() {
            return;
        }
        self.started_at = Some(now);

        for (index, slot) in self.slots.iter_mut().enumerate() {
            let deadline = now + slot.period;
            slot.state = MessageState::Armed;
            slot.next_deadline = Some(deadline);
            self.queue.push(Reverse((deadline, index)));
        }

        log::info!("Cyclic scheduler armed {} messages", self.slots.len());
    }

    /// Run until shutdown is requested
    ///
    /// Starts the scheduler if [`start`](Self::start) was not called yet.
    /// Shutdown is observed while waiting for a deadline; a fire in progress
    /// always completes its send first.
    pub async fn run(&mut self, mut shutdown: ShutdownReceiver) -> SchedulerStats {
        self.start(Instant::now());

        if self.queue.is_empty() {
            log::warn!("No periodic messages to send, waiting for shutdown");
            shutdown::requested(&mut shutdown).await;
            return self.stats.clone();
        }

        while let Some(Reverse((deadline, index))) = self.queue.peek().copied() {
            if !shutdown::sleep_until(&mut shutdown, deadline).await {
                break;
            }
            self.queue.pop();
            self.fire(index, deadline).await;
        }

        log::info!(
            "Cyclic scheduler stopped: {} frames sent, {} missed deadlines",
            self.stats.frames_sent,
            self.stats.missed_deadlines
        );
        self.stats.clone()
    }

    async fn fire(&mut self, index: usize, deadline: Instant) {
        let started = Instant::now();
        let started_at = self.started_at.unwrap_or(started);

        let slot = &mut self.slots[index];
        let message = &self.catalog.messages()[slot.message_index];
        slot.state = MessageState::Firing;
        slot.cycle += 1;

        let values = self.generator.next_values(message, &mut slot.values);
        let range_violations = message.range_violations(&values);
        for violation in &range_violations {
            log::warn!("{}: {}", message.name, violation);
        }

        match codec::encode_message(message, &values) {
            Ok(data) => {
                let frame = CanFrame::new(message.id, data).with_extended(message.is_extended);
                log::debug!(
                    "actual data: {:?} - message: 0x{:X} {}",
                    values,
                    message.id,
                    hex_string(&frame.data)
                );

                match self.bus.send(&frame).await {
                    Ok(()) => {
                        self.stats.frames_sent += 1;
                        self.sink.emit(&BusEvent::Transmitted {
                            timestamp: Utc::now(),
                            frame_id: message.id,
                            message_name: message.name.clone(),
                            values,
                            data: frame.data,
                            cycle: slot.cycle,
                            scheduled_at: deadline.saturating_duration_since(started_at),
                            range_violations,
                        });
                    }
                    Err(e) => {
                        self.stats.send_failures += 1;
                        log::error!("Failed to send {} (0x{:X}): {}", message.name, message.id, e);
                        self.sink.emit(&BusEvent::TransportFailure {
                            timestamp: Utc::now(),
                            frame_id: Some(message.id),
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Err(e) => {
                self.stats.encode_failures += 1;
                log::error!("Failed to encode {}: {}", message.name, e);
            }
        }

        let finished = Instant::now();
        let (next, missed) = next_deadline(self.policy, deadline, slot.period, started, finished);
        if missed {
            self.stats.missed_deadlines += 1;
            log::warn!(
                "{} fired {}ms late (period {}ms)",
                message.name,
                started.saturating_duration_since(deadline).as_millis(),
                slot.period.as_millis()
            );
        }

        slot.state = MessageState::Armed;
        slot.next_deadline = Some(next);
        self.queue.push(Reverse((next, index)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::VirtualBus;
    use crate::signals::{ByteOrder, MessageDefinition, SignalDefinition};
    use crate::sink::CollectingSink;

    fn speed_message(id: u32, name: &str, cycle_time_ms: Option<u64>) -> MessageDefinition {
        let message = MessageDefinition::new(id, name, 2).with_signal(
            SignalDefinition::new("Speed", 0, 16, ByteOrder::LittleEndian)
                .with_scaling(0.1, 0.0)
                .with_range(0.0, 250.0),
        );
        match cycle_time_ms {
            Some(ms) => message.with_cycle_time(ms),
            None => message,
        }
    }

    fn scheduler(
        messages: Vec<MessageDefinition>,
        bus: Arc<VirtualBus>,
        config: SimulatorConfig,
    ) -> CyclicScheduler<VirtualBus, CollectingSink> {
        let catalog = Arc::new(Catalog::new(messages).unwrap());
        CyclicScheduler::new(catalog, bus, CollectingSink::new(), &config.with_seed(11))
    }

    fn stop_after(ms: u64) -> ShutdownReceiver {
        let (tx, rx) = shutdown::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let _ = tx.send(true);
        });
        rx
    }

    fn scheduled_at(events: &[BusEvent]) -> Vec<u128> {
        events
            .iter()
            .filter_map(|event| match event {
                BusEvent::Transmitted { scheduled_at, .. } => Some(scheduled_at.as_millis()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_next_deadline_on_time() {
        let deadline = Instant::now();
        let period = Duration::from_millis(100);
        let started = deadline + Duration::from_millis(30);
        let finished = started + Duration::from_millis(5);

        for policy in [MissedDeadlinePolicy::Realign, MissedDeadlinePolicy::CatchUp] {
            let (next, missed) = next_deadline(policy, deadline, period, started, finished);
            assert_eq!(next, deadline + period);
            assert!(!missed);
        }
    }

    #[test]
    fn test_next_deadline_missed() {
        let deadline = Instant::now();
        let period = Duration::from_millis(100);
        let started = deadline + Duration::from_millis(250);
        let finished = started + Duration::from_millis(10);

        let (next, missed) =
            next_deadline(MissedDeadlinePolicy::Realign, deadline, period, started, finished);
        assert!(missed);
        assert_eq!(next, finished + period);

        let (next, missed) =
            next_deadline(MissedDeadlinePolicy::CatchUp, deadline, period, started, finished);
        assert!(missed);
        assert_eq!(next, deadline + period);
    }

    #[test]
    fn test_only_periodic_messages_are_scheduled() {
        let bus = Arc::new(VirtualBus::new());
        let messages = vec![
            speed_message(0x100, "Fast", Some(10)),
            speed_message(0x200, "OnDemand", None),
        ];
        let scheduler = scheduler(messages, bus, SimulatorConfig::default());

        assert_eq!(scheduler.scheduled_count(), 1);
        assert_eq!(scheduler.message_state("Fast"), Some(MessageState::Idle));
        assert_eq!(scheduler.message_state("OnDemand"), None);
    }

    #[test]
    fn test_default_cycle_time_schedules_everything() {
        let bus = Arc::new(VirtualBus::new());
        let messages = vec![
            speed_message(0x100, "Fast", Some(10)),
            speed_message(0x200, "OnDemand", None),
        ];
        let mut scheduler = scheduler(
            messages,
            bus,
            SimulatorConfig::new().with_default_cycle_time(500),
        );
        assert_eq!(scheduler.scheduled_count(), 2);

        scheduler.start(Instant::now());
        assert_eq!(scheduler.message_state("OnDemand"), Some(MessageState::Armed));
        assert_eq!(
            scheduler.next_deadline_of("OnDemand"),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            scheduler.next_deadline_of("Fast"),
            Some(Duration::from_millis(10))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_drift_over_100_cycles() {
        let bus = Arc::new(VirtualBus::new());
        let mut scheduler = scheduler(
            vec![speed_message(0x100, "Vehicle", Some(100))],
            bus.clone(),
            SimulatorConfig::default(),
        );

        let stats = scheduler.run(stop_after(10_050)).await;
        assert_eq!(stats.frames_sent, 100);
        assert_eq!(stats.missed_deadlines, 0);
        assert_eq!(bus.frames_sent(), 100);

        let events = scheduler.sink().events();
        match events.last() {
            Some(BusEvent::Transmitted {
                cycle, scheduled_at, ..
            }) => {
                assert_eq!(*cycle, 100);
                assert_eq!(*scheduled_at, Duration::from_millis(10_000));
            }
            other => panic!("unexpected last event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_cadences() {
        let bus = Arc::new(VirtualBus::new());
        let mut scheduler = scheduler(
            vec![
                speed_message(0x100, "Fast", Some(100)),
                speed_message(0x200, "Slow", Some(250)),
            ],
            bus,
            SimulatorConfig::default(),
        );

        scheduler.run(stop_after(1_010)).await;

        let events = scheduler.sink().events();
        let count = |id: u32| events.iter().filter(|e| e.frame_id() == Some(id)).count();
        assert_eq!(count(0x100), 10);
        assert_eq!(count(0x200), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realign_after_stalled_send() {
        let bus = Arc::new(VirtualBus::new());
        bus.set_send_delay(Duration::from_millis(250));
        let mut scheduler = scheduler(
            vec![speed_message(0x100, "Vehicle", Some(100))],
            bus,
            SimulatorConfig::new().with_missed_deadline_policy(MissedDeadlinePolicy::Realign),
        );

        let stats = scheduler.run(stop_after(1_450)).await;

        assert_eq!(
            scheduled_at(&scheduler.sink().events()),
            vec![100, 200, 700, 800, 1300]
        );
        assert_eq!(stats.missed_deadlines, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_after_stalled_send() {
        let bus = Arc::new(VirtualBus::new());
        bus.set_send_delay(Duration::from_millis(250));
        let mut scheduler = scheduler(
            vec![speed_message(0x100, "Vehicle", Some(100))],
            bus,
            SimulatorConfig::new().with_missed_deadline_policy(MissedDeadlinePolicy::CatchUp),
        );

        let stats = scheduler.run(stop_after(1_450)).await;

        assert_eq!(
            scheduled_at(&scheduler.sink().events()),
            vec![100, 200, 300, 400, 500, 600]
        );
        assert_eq!(stats.missed_deadlines, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_loopback_queue_stays_bounded() {
        let bus = Arc::new(VirtualBus::with_capacity(64));
        let mut scheduler = scheduler(
            vec![speed_message(0x100, "Vehicle", Some(10))],
            bus.clone(),
            SimulatorConfig::default(),
        );

        // Nothing receives: ten minutes of 10 ms traffic
        let stats = scheduler.run(stop_after(600_005)).await;
        assert_eq!(stats.frames_sent, 60_000);
        assert_eq!(bus.frames_sent(), 60_000);
        assert_eq!(bus.queued_frames(), 64);
        assert_eq!(bus.frames_dropped(), 60_000 - 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_do_not_stop_scheduler() {
        let bus = Arc::new(VirtualBus::new());
        bus.set_send_failure(true);
        let mut scheduler = scheduler(
            vec![speed_message(0x100, "Vehicle", Some(100))],
            bus,
            SimulatorConfig::default(),
        );

        let stats = scheduler.run(stop_after(550)).await;
        assert_eq!(stats.send_failures, 5);
        assert_eq!(stats.frames_sent, 0);
        assert!(scheduler
            .sink()
            .events()
            .iter()
            .all(|e| matches!(e, BusEvent::TransportFailure { frame_id: Some(0x100), .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_snapshot_tracks_last_values() {
        let bus = Arc::new(VirtualBus::new());
        let mut scheduler = scheduler(
            vec![speed_message(0x100, "Vehicle", Some(100))],
            bus,
            SimulatorConfig::default(),
        );
        assert!(scheduler.generator_snapshot().is_empty());

        scheduler.run(stop_after(350)).await;

        let snapshot = scheduler.generator_snapshot();
        let last_sent = match scheduler.sink().events().last() {
            Some(BusEvent::Transmitted { values, .. }) => values.clone(),
            other => panic!("unexpected last event: {:?}", other),
        };
        assert_eq!(snapshot["Vehicle"], last_sent);
        assert_eq!(scheduler.message_state("Vehicle"), Some(MessageState::Armed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_periodic_messages_waits_for_shutdown() {
        let bus = Arc::new(VirtualBus::new());
        let mut scheduler = scheduler(
            vec![speed_message(0x100, "OnDemand", None)],
            bus,
            SimulatorConfig::default(),
        );
        let stats = scheduler.run(stop_after(100)).await;
        assert_eq!(stats, SchedulerStats::default());
    }
}
