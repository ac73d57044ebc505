// =============================================================================
// GEOPULSE — Per-Zone State (windows + hysteretic state machine)
// =============================================================================
// Pure, non-suspending event-time logic. One ZoneState per zone, mutated only
// by the worker that owns the zone's shard, fed events in arrival order.
//
// The state blocks evaluate sequentially per event (NORMAL, then STRESSED,
// then CRITICAL-on-entry-state), so the event that fires NORMAL→STRESSED also
// arms the CRITICAL confirmation timer with its own timestamp. At most one
// edge fires per event. Alert dedup compares event timestamps, never the wall
// clock, so replaying the same stream yields an identical alert sequence.
// =============================================================================

use crate::event::{SampleEvent, ZoneHealth};
use crate::window::SlidingWindow;

pub const T_STRESSED_UP: f64 = 0.75;
pub const T_CRITICAL_UP: f64 = 0.90;
pub const T_CRITICAL_DOWN: f64 = 0.80;
pub const T_STRESSED_DOWN: f64 = 0.65;
pub const CONFIRM_STRESSED_MS: i64 = 60_000;
pub const CONFIRM_CRITICAL_MS: i64 = 20_000;
const ALERT_DEDUP_MS: i64 = 1_000;

/// One fired state change. `emit` is false when the 1 s dedup guard
/// suppressed the alert; the transition itself still happened.
#[derive(Clone, Debug, PartialEq)]
pub struct FiredTransition {
    pub previous: ZoneHealth,
    pub current: ZoneHealth,
    pub avg_1m: f64,
    pub avg_5m: f64,
    pub timestamp: i64,
    pub emit: bool,
}

/// Hysteretic three-state machine with confirmation timers, all in event time.
#[derive(Debug)]
struct Fsm {
    state: ZoneHealth,
    stressed_since: Option<i64>,
    critical_since: Option<i64>,
}

impl Fsm {
    fn new() -> Self {
        Self {
            state: ZoneHealth::Normal,
            stressed_since: None,
            critical_since: None,
        }
    }

    /// Advances the machine one event, returning the fired edge if any.
    ///
    /// The STRESSED block also runs when this very event entered STRESSED
    /// from NORMAL: the upgrade cannot fire twice (its timer was just armed),
    /// but the CRITICAL confirmation starts counting from this event. The
    /// CRITICAL block only runs when the event arrived in CRITICAL.
    fn step(&mut self, avg_1m: f64, avg_5m: f64, t: i64) -> Option<(ZoneHealth, ZoneHealth)> {
        let entry_state = self.state;
        let mut fired = None;

        if self.state == ZoneHealth::Normal {
            if avg_5m >= T_STRESSED_UP {
                let since = *self.stressed_since.get_or_insert(t);
                if t - since >= CONFIRM_STRESSED_MS {
                    self.stressed_since = None;
                    self.state = ZoneHealth::Stressed;
                    fired = Some((ZoneHealth::Normal, ZoneHealth::Stressed));
                }
            } else {
                self.stressed_since = None;
            }
        }

        if self.state == ZoneHealth::Stressed {
            if avg_1m >= T_CRITICAL_UP {
                let since = *self.critical_since.get_or_insert(t);
                if t - since >= CONFIRM_CRITICAL_MS {
                    self.critical_since = None;
                    self.state = ZoneHealth::Critical;
                    fired = Some((ZoneHealth::Stressed, ZoneHealth::Critical));
                }
            } else if avg_5m <= T_STRESSED_DOWN {
                self.stressed_since = None;
                self.critical_since = None;
                self.state = ZoneHealth::Normal;
                fired = Some((ZoneHealth::Stressed, ZoneHealth::Normal));
            } else {
                self.critical_since = None;
            }
        }

        if entry_state == ZoneHealth::Critical && avg_5m <= T_CRITICAL_DOWN {
            self.critical_since = None;
            // Arms a prompt re-entry path should load rebound.
            self.stressed_since = Some(t);
            self.state = ZoneHealth::Stressed;
            fired = Some((ZoneHealth::Critical, ZoneHealth::Stressed));
        }

        fired
    }
}

/// Everything the processor keeps for one zone: the two event-time windows,
/// the state machine, the alert dedup cursor, and the last seen coordinates.
#[derive(Debug)]
pub struct ZoneState {
    win_1m: SlidingWindow,
    win_5m: SlidingWindow,
    fsm: Fsm,
    last_alert_ts: Option<i64>,
    pub last_coord: Option<(f64, f64)>,
}

impl ZoneState {
    pub fn new() -> Self {
        Self {
            win_1m: SlidingWindow::new(60),
            win_5m: SlidingWindow::new(300),
            fsm: Fsm::new(),
            last_alert_ts: None,
            last_coord: None,
        }
    }

    #[cfg(test)]
    fn state(&self) -> ZoneHealth {
        self.fsm.state
    }

    #[cfg(test)]
    fn averages(&self) -> (f64, f64) {
        (self.win_1m.average(), self.win_5m.average())
    }

    /// Feeds one sample: updates both windows, steps the state machine, and
    /// applies the alert emission guard to the fired edge.
    pub fn apply(&mut self, ev: &SampleEvent) -> Option<FiredTransition> {
        let t = ev.event_timestamp;
        self.win_1m.add(t, ev.load);
        self.win_5m.add(t, ev.load);
        self.last_coord = Some((ev.latitude, ev.longitude));

        let avg_1m = self.win_1m.average();
        let avg_5m = self.win_5m.average();

        let (previous, current) = self.fsm.step(avg_1m, avg_5m, t)?;
        let emit = self.last_alert_ts.map_or(true, |last| t - last > ALERT_DEDUP_MS);
        if emit {
            self.last_alert_ts = Some(t);
        }
        Some(FiredTransition {
            previous,
            current,
            avg_1m,
            avg_5m,
            timestamp: t,
            emit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(t: i64, load: f64) -> SampleEvent {
        SampleEvent {
            event_id: format!("e-{t}"),
            zone_id: "Z-1".into(),
            latitude: 41.0,
            longitude: 29.0,
            load,
            event_timestamp: t,
            produced_at: t,
        }
    }

    fn feed(zone: &mut ZoneState, t: i64, load: f64) -> Option<FiredTransition> {
        zone.apply(&event(t, load))
    }

    fn emitted(zone: &mut ZoneState, events: impl Iterator<Item = (i64, f64)>) -> Vec<FiredTransition> {
        events
            .filter_map(|(t, load)| feed(zone, t, load))
            .filter(|tr| tr.emit)
            .collect()
    }

    // ---- state machine boundaries (exact threshold arithmetic) ----

    #[test]
    fn test_stressed_up_threshold_is_inclusive() {
        let mut fsm = Fsm::new();
        assert!(fsm.step(0.0, 0.75, 0).is_none(), "arming must not fire");
        let fired = fsm.step(0.0, 0.75, 60_000);
        assert_eq!(fired, Some((ZoneHealth::Normal, ZoneHealth::Stressed)));
        assert_eq!(fsm.stressed_since, None);
    }

    #[test]
    fn test_critical_up_threshold_is_inclusive() {
        let mut fsm = Fsm {
            state: ZoneHealth::Stressed,
            stressed_since: None,
            critical_since: None,
        };
        assert!(fsm.step(0.90, 0.70, 0).is_none());
        let fired = fsm.step(0.90, 0.70, 20_000);
        assert_eq!(fired, Some((ZoneHealth::Stressed, ZoneHealth::Critical)));
    }

    #[test]
    fn test_stressed_down_threshold_is_inclusive() {
        let mut fsm = Fsm {
            state: ZoneHealth::Stressed,
            stressed_since: None,
            critical_since: Some(5),
        };
        let fired = fsm.step(0.0, 0.65, 1_000);
        assert_eq!(fired, Some((ZoneHealth::Stressed, ZoneHealth::Normal)));
        assert_eq!(fsm.critical_since, None, "downgrade must clear both timers");
    }

    #[test]
    fn test_critical_down_threshold_is_inclusive_and_arms_reentry() {
        let mut fsm = Fsm {
            state: ZoneHealth::Critical,
            stressed_since: None,
            critical_since: None,
        };
        let fired = fsm.step(0.95, 0.80, 7_000);
        assert_eq!(fired, Some((ZoneHealth::Critical, ZoneHealth::Stressed)));
        assert_eq!(fsm.stressed_since, Some(7_000));
    }

    #[test]
    fn test_confirmation_fires_exactly_at_window_edge() {
        let mut fsm = Fsm::new();
        fsm.step(0.0, 0.80, 1_000);
        assert!(fsm.step(0.0, 0.80, 60_999).is_none(), "59 999 ms held is not enough");
        assert!(
            fsm.step(0.0, 0.80, 61_000).is_some(),
            "must fire on the event reaching exactly 60 000 ms"
        );
    }

    #[test]
    fn test_condition_break_resets_confirmation_timer() {
        let mut fsm = Fsm::new();
        fsm.step(0.0, 0.80, 0);
        fsm.step(0.0, 0.70, 30_000); // breaks the condition
        assert_eq!(fsm.stressed_since, None);
        fsm.step(0.0, 0.80, 31_000); // re-arms
        assert!(fsm.step(0.0, 0.80, 90_000).is_none(), "old arming must not count");
        assert!(fsm.step(0.0, 0.80, 91_000).is_some());
    }

    #[test]
    fn test_critical_timer_resets_when_one_minute_average_dips() {
        let mut fsm = Fsm {
            state: ZoneHealth::Stressed,
            stressed_since: None,
            critical_since: None,
        };
        fsm.step(0.95, 0.70, 0);
        fsm.step(0.85, 0.70, 10_000); // a1 dips below the up-threshold
        assert_eq!(fsm.critical_since, None);
        fsm.step(0.95, 0.70, 11_000);
        assert!(fsm.step(0.95, 0.70, 30_000).is_none());
        assert!(fsm.step(0.95, 0.70, 31_000).is_some());
    }

    #[test]
    fn test_direct_normal_to_critical_is_impossible() {
        let mut fsm = Fsm::new();
        fsm.step(1.0, 1.0, 0);
        let fired = fsm.step(1.0, 1.0, 60_000);
        assert_eq!(fired, Some((ZoneHealth::Normal, ZoneHealth::Stressed)));
        assert_eq!(fsm.state, ZoneHealth::Stressed);
        // The same event armed the CRITICAL timer, so confirmation counts
        // from the NORMAL→STRESSED event.
        assert_eq!(fsm.critical_since, Some(60_000));
        let fired = fsm.step(1.0, 1.0, 80_000);
        assert_eq!(fired, Some((ZoneHealth::Stressed, ZoneHealth::Critical)));
    }

    #[test]
    fn test_upgrade_does_not_bounce_back_on_the_same_event() {
        // 1m spike over a collapsed 5m average: the upgrade fires, the
        // CRITICAL block must wait for the next event to downgrade.
        let mut fsm = Fsm {
            state: ZoneHealth::Stressed,
            stressed_since: None,
            critical_since: Some(0),
        };
        let fired = fsm.step(0.95, 0.30, 20_000);
        assert_eq!(fired, Some((ZoneHealth::Stressed, ZoneHealth::Critical)));
        assert_eq!(fsm.state, ZoneHealth::Critical);
        let fired = fsm.step(0.95, 0.30, 21_000);
        assert_eq!(fired, Some((ZoneHealth::Critical, ZoneHealth::Stressed)));
    }

    #[test]
    fn test_raising_load_never_fires_a_downward_edge() {
        let mut fsm = Fsm {
            state: ZoneHealth::Stressed,
            stressed_since: None,
            critical_since: None,
        };
        for i in 0..200 {
            let a = 0.66 + (i as f64) * 0.0017; // monotonically rising
            if let Some((prev, cur)) = fsm.step(a, a, i * 1_000) {
                assert!(
                    !matches!(
                        (prev, cur),
                        (ZoneHealth::Stressed, ZoneHealth::Normal)
                            | (ZoneHealth::Critical, ZoneHealth::Stressed)
                    ),
                    "rising averages fired a downward edge at step {i}"
                );
            }
        }
    }

    #[test]
    fn test_falling_load_never_fires_an_upward_edge() {
        let mut fsm = Fsm {
            state: ZoneHealth::Critical,
            stressed_since: None,
            critical_since: None,
        };
        for i in 0..200 {
            let a = 1.0 - (i as f64) * 0.005;
            if let Some((prev, cur)) = fsm.step(a, a, i * 1_000) {
                assert!(
                    !matches!(
                        (prev, cur),
                        (ZoneHealth::Normal, ZoneHealth::Stressed)
                            | (ZoneHealth::Stressed, ZoneHealth::Critical)
                    ),
                    "falling averages fired an upward edge at step {i}"
                );
            }
        }
    }

    #[test]
    fn test_hysteresis_band_produces_no_transitions() {
        let mut fsm = Fsm {
            state: ZoneHealth::Stressed,
            stressed_since: None,
            critical_since: None,
        };
        // a5 oscillating strictly inside (T_stressed_down, T_stressed_up).
        for i in 0..500 {
            let a5 = if i % 2 == 0 { 0.66 } else { 0.74 };
            assert!(fsm.step(0.5, a5, i * 1_000).is_none());
        }
        assert_eq!(fsm.state, ZoneHealth::Stressed);
    }

    // ---- full zone behavior through the windows ----

    #[test]
    fn test_clean_ramp_to_critical() {
        let mut zone = ZoneState::new();
        let alerts = emitted(&mut zone, (0..400).map(|i| (1_000_000 + 1_000 * i, 0.95)));

        assert_eq!(alerts.len(), 2, "expected exactly two alerts, got {alerts:?}");
        assert_eq!(
            (alerts[0].previous, alerts[0].current, alerts[0].timestamp),
            (ZoneHealth::Normal, ZoneHealth::Stressed, 1_060_000)
        );
        assert!((alerts[0].avg_5m - 0.95).abs() < 1e-9);
        assert_eq!(
            (alerts[1].previous, alerts[1].current, alerts[1].timestamp),
            (ZoneHealth::Stressed, ZoneHealth::Critical, 1_080_000)
        );
        assert!((alerts[1].avg_1m - 0.95).abs() < 1e-9);
        assert_eq!(zone.state(), ZoneHealth::Critical);
    }

    #[test]
    fn test_recovery_ramp_down() {
        let mut zone = ZoneState::new();
        emitted(&mut zone, (0..400).map(|i| (1_000_000 + 1_000 * i, 0.95)));
        let alerts = emitted(&mut zone, (0..300).map(|j| (1_400_000 + 1_000 * j, 0.10)));

        assert_eq!(alerts.len(), 2, "expected downgrade then recovery, got {alerts:?}");
        // First event where avg5m drops to 0.80: (247·0.95 + 53·0.10)/300.
        assert_eq!(
            (alerts[0].previous, alerts[0].current, alerts[0].timestamp),
            (ZoneHealth::Critical, ZoneHealth::Stressed, 1_452_000)
        );
        assert!(alerts[0].avg_5m <= T_CRITICAL_DOWN);
        // First event where avg5m drops to 0.65: (194·0.95 + 106·0.10)/300.
        assert_eq!(
            (alerts[1].previous, alerts[1].current, alerts[1].timestamp),
            (ZoneHealth::Stressed, ZoneHealth::Normal, 1_505_000)
        );
        assert!(alerts[1].avg_5m <= T_STRESSED_DOWN);
        assert_eq!(zone.state(), ZoneHealth::Normal);
    }

    #[test]
    fn test_thrashing_load_is_suppressed() {
        let mut zone = ZoneState::new();
        let alerts = emitted(
            &mut zone,
            (0..120).map(|i| (i * 1_000, if i % 2 == 0 { 0.80 } else { 0.00 })),
        );
        assert!(alerts.is_empty(), "oscillating load must not alert: {alerts:?}");
        assert_eq!(zone.state(), ZoneHealth::Normal);
    }

    #[test]
    fn test_confirmation_reset_delays_the_alert() {
        let mut zone = ZoneState::new();
        let mut events: Vec<(i64, f64)> = (0..6).map(|i| (i * 1_000, 0.85)).collect();
        events.push((6_000, 0.10)); // drags avg5m to 5.2/7 ≈ 0.743, below 0.75
        events.extend((7..=70).map(|i| (i * 1_000, 0.85)));

        let alerts = emitted(&mut zone, events.into_iter());
        assert_eq!(alerts.len(), 1, "exactly one alert after the reset: {alerts:?}");
        assert_eq!(
            (alerts[0].previous, alerts[0].current),
            (ZoneHealth::Normal, ZoneHealth::Stressed)
        );
        // Timer re-armed at t=7000 once the dip left the average; without the
        // reset this would have fired at t=60000.
        assert_eq!(alerts[0].timestamp, 67_000);
    }

    #[test]
    fn test_out_of_order_event_lands_in_its_own_second() {
        let mut zone = ZoneState::new();
        let mut fired = Vec::new();
        for i in 0..60 {
            fired.extend(feed(&mut zone, 1_000_000 + 1_000 * i, 0.95));
        }
        let (a1_before, a5_before) = zone.averages();

        // 30 s older than the newest event, zero load.
        fired.extend(feed(&mut zone, 1_029_000, 0.0));
        let (a1_after, a5_after) = zone.averages();

        assert!(fired.is_empty(), "no transition may fire: {fired:?}");
        assert_eq!(zone.state(), ZoneHealth::Normal);
        assert!(a1_after < a1_before && a5_after < a5_before, "late zero must drag averages");
        assert!(a5_after > 0.90, "one zero among 60 samples only dents the mean");
        assert!((a5_before - 0.95).abs() < 1e-9);
        assert!((a1_after - 57.0 / 61.0).abs() < 1e-9);
    }

    #[test]
    fn test_alert_guard_suppresses_adjacent_transition() {
        let mut zone = ZoneState::new();
        feed(&mut zone, 0, 0.80);
        let up = feed(&mut zone, 60_000, 0.80).expect("upgrade fires at 60 s");
        assert!(up.emit);

        // 500 ms later a zero sample collapses avg5m to 1.6/3 ≈ 0.53: the
        // STRESSED→NORMAL edge fires but its alert is deduped.
        let down = feed(&mut zone, 60_500, 0.0).expect("downgrade fires");
        assert_eq!(
            (down.previous, down.current),
            (ZoneHealth::Stressed, ZoneHealth::Normal)
        );
        assert!(!down.emit, "alert within 1 s of the last must be suppressed");
        assert_eq!(zone.state(), ZoneHealth::Normal, "the state change itself still happens");
    }

    #[test]
    fn test_replay_produces_identical_alerts() {
        let stream: Vec<(i64, f64)> = (0..2_000)
            .map(|i| {
                let load = ((i * 7_919) % 101) as f64 / 100.0;
                // Every 17th event arrives 5 s late.
                let t = 1_000_000 + i * 1_000 - if i % 17 == 0 { 5_000 } else { 0 };
                (t, load)
            })
            .collect();

        let mut first = ZoneState::new();
        let mut second = ZoneState::new();
        let a: Vec<FiredTransition> =
            stream.iter().filter_map(|&(t, l)| feed(&mut first, t, l)).collect();
        let b: Vec<FiredTransition> =
            stream.iter().filter_map(|&(t, l)| feed(&mut second, t, l)).collect();
        assert_eq!(a, b, "replay on fresh state must be identical");
    }

    #[test]
    fn test_emitted_alerts_form_a_legal_chain() {
        let mut zone = ZoneState::new();
        let mut alerts = emitted(&mut zone, (0..400).map(|i| (1_000_000 + 1_000 * i, 0.95)));
        alerts.extend(emitted(&mut zone, (0..300).map(|j| (1_400_000 + 1_000 * j, 0.10))));
        alerts.extend(emitted(&mut zone, (0..400).map(|k| (1_700_000 + 1_000 * k, 0.95))));

        let legal = [
            (ZoneHealth::Normal, ZoneHealth::Stressed),
            (ZoneHealth::Stressed, ZoneHealth::Critical),
            (ZoneHealth::Critical, ZoneHealth::Stressed),
            (ZoneHealth::Stressed, ZoneHealth::Normal),
        ];
        assert!(alerts.len() >= 6, "stream should exercise the full cycle twice");
        for alert in &alerts {
            assert_ne!(alert.previous, alert.current);
            assert!(legal.contains(&(alert.previous, alert.current)), "illegal edge {alert:?}");
        }
        for pair in alerts.windows(2) {
            assert_eq!(pair[1].previous, pair[0].current, "alert chain must be gapless");
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }
    }
}
