//! Property-based tests for tick accounting.

use proptest::prelude::*;

use kegtap_core::{EventBus, Tap};
use kegtap_flow::{FlowConfig, FlowManager, TapManager};

const METER: &str = "kegboard-ab12.flow0";

fn manager() -> FlowManager {
    let taps = TapManager::new();
    taps.update_taps(vec![Tap::new(1, "Tap 1", METER)]);
    FlowManager::new(taps, EventBus::new(), FlowConfig::default())
}

proptest! {
    /// Property: for non-decreasing readings, flow ticks equal last minus first.
    #[test]
    fn prop_monotonic_readings_sum_deltas(
        start in 0u64..1_000_000,
        steps in prop::collection::vec(0u64..500, 1..50),
    ) {
        let flows = manager();
        flows.handle_meter_activity(METER, start).unwrap();

        let mut reading = start;
        for step in &steps {
            reading += step;
            flows.handle_meter_activity(METER, reading).unwrap();
        }

        let total: u64 = steps.iter().sum();
        let ticks = flows.flow_for_tap(1).map_or(0, |f| f.ticks());
        prop_assert_eq!(ticks, total);
    }

    /// Property: arbitrary readings never lose or invent ticks; drops count as zero.
    #[test]
    fn prop_resets_never_go_negative(
        readings in prop::collection::vec(0u64..10_000, 2..50),
    ) {
        let flows = manager();
        for reading in &readings {
            flows.handle_meter_activity(METER, *reading).unwrap();
        }

        let expected: u64 = readings
            .windows(2)
            .map(|pair| pair[1].saturating_sub(pair[0]))
            .sum();
        let ticks = flows.flow_for_tap(1).map_or(0, |f| f.ticks());
        prop_assert_eq!(ticks, expected);
    }
}
