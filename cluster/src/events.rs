//! Cluster events attached to observed resources.

use chrono::DateTime;
use chrono::Utc;
use k8s_openapi::api::core::v1::Event;

/// The event type of warnings.
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// An observed resource paired with the events that reference it.
///
/// Events are ordered by time, oldest first.
#[derive(Debug, Clone)]
pub struct WithEvents<T> {
    /// The observed resource.
    pub value: T,
    /// The events referencing the resource.
    pub events: Vec<Event>,
}

impl<T> WithEvents<T> {
    /// Pairs a resource with no events.
    pub fn new(value: T) -> Self {
        Self {
            value,
            events: Vec::new(),
        }
    }

    /// Pairs a resource with its events, ordering them by time.
    pub fn with_events(value: T, mut events: Vec<Event>) -> Self {
        events.sort_by_key(event_time);
        Self { value, events }
    }

    /// Gets the most significant recent event.
    ///
    /// See [`significant_event`].
    pub fn significant_event(&self) -> Option<&Event> {
        significant_event(&self.events)
    }
}

/// Gets the time an event was last observed.
///
/// This is the latest of the event's own time, its series' last observation,
/// and its first and last timestamps.
pub fn event_time(event: &Event) -> Option<DateTime<Utc>> {
    [
        event.event_time.as_ref().map(|t| t.0),
        event
            .series
            .as_ref()
            .and_then(|s| s.last_observed_time.as_ref())
            .map(|t| t.0),
        event.first_timestamp.as_ref().map(|t| t.0),
        event.last_timestamp.as_ref().map(|t| t.0),
    ]
    .into_iter()
    .flatten()
    .max()
}

/// Determines if an event is a warning.
pub fn is_warning(event: &Event) -> bool {
    event.type_.as_deref() == Some(EVENT_TYPE_WARNING)
}

/// Gets the component that reported the event.
fn reporter(event: &Event) -> &str {
    event
        .reporting_component
        .as_deref()
        .filter(|c| !c.is_empty())
        .or_else(|| event.source.as_ref().and_then(|s| s.component.as_deref()))
        .unwrap_or_default()
}

/// Selects the most significant event.
///
/// Only the latest event of each reporting component is considered, so a
/// normal event supersedes an earlier warning from the same component. Among
/// those, a warning beats a normal event and otherwise the later event wins.
pub fn significant_event(events: &[Event]) -> Option<&Event> {
    let mut latest: Vec<&Event> = Vec::new();
    for event in events {
        match latest.iter_mut().find(|e| reporter(e) == reporter(event)) {
            Some(current) => {
                if event_time(event) >= event_time(current) {
                    *current = event;
                }
            }
            None => latest.push(event),
        }
    }

    latest.into_iter().reduce(|best, event| {
        match (is_warning(best), is_warning(event)) {
            (false, true) => event,
            (true, false) => best,
            _ if event_time(event) >= event_time(best) => event,
            _ => best,
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    /// Creates an event reported at the given second.
    pub(crate) fn event(reporter: &str, type_: &str, reason: &str, at: i64) -> Event {
        Event {
            type_: Some(type_.to_string()),
            reason: Some(reason.to_string()),
            message: Some(format!("{reason} happened")),
            reporting_component: Some(reporter.to_string()),
            last_timestamp: Some(Time(Utc.timestamp_opt(at, 0).unwrap())),
            ..Default::default()
        }
    }

    #[test]
    fn no_events_are_insignificant() {
        assert!(significant_event(&[]).is_none());
    }

    #[test]
    fn later_normal_events_supersede_warnings_of_the_same_reporter() {
        let events = [
            event("kubelet", "Warning", "BackOff", 1),
            event("kubelet", "Normal", "Pulled", 2),
        ];

        let significant = significant_event(&events).unwrap();
        assert_eq!(significant.reason.as_deref(), Some("Pulled"));
    }

    #[test]
    fn warnings_beat_normal_events_of_other_reporters() {
        let events = [
            event("kubelet", "Warning", "FailedMount", 1),
            event("default-scheduler", "Normal", "Scheduled", 2),
        ];

        let significant = significant_event(&events).unwrap();
        assert_eq!(significant.reason.as_deref(), Some("FailedMount"));
    }

    #[test]
    fn the_latest_of_equal_types_wins() {
        let events = [
            event("kubelet", "Warning", "FailedMount", 3),
            event("attachdetach-controller", "Warning", "FailedAttachVolume", 5),
        ];

        let significant = significant_event(&events).unwrap();
        assert_eq!(significant.reason.as_deref(), Some("FailedAttachVolume"));
    }

    #[test]
    fn events_are_ordered_by_time() {
        let observed = WithEvents::with_events(
            (),
            vec![
                event("kubelet", "Normal", "Started", 9),
                event("kubelet", "Normal", "Pulled", 4),
            ],
        );

        let reasons: Vec<_> = observed
            .events
            .iter()
            .filter_map(|e| e.reason.as_deref())
            .collect();
        assert_eq!(reasons, ["Pulled", "Started"]);
    }
}
