//! Conversions from engine state to backend records.

use kegtap_core::FlowSnapshot;
use kegtap_core::backend::RecordDrinkRequest;

/// Build the pour record for a finished flow.
///
/// A flow without a tap yields an empty `tap`, which the sync task discards.
pub fn drink_from_flow(flow: &FlowSnapshot) -> RecordDrinkRequest {
    RecordDrinkRequest {
        tap: flow
            .tap
            .as_ref()
            .map(|tap| tap.meter_name.clone())
            .unwrap_or_default(),
        volume_ml: flow.volume_ml(),
        ticks: flow.ticks,
        shout: flow.shout.clone(),
        username: flow.username.clone(),
        record_date: flow.ended_at.unwrap_or(flow.last_activity_at),
        duration_ms: flow.duration_ms(),
        tick_time_series: flow.tick_series.clone(),
        picture: flow.images.first().cloned(),
    }
}
