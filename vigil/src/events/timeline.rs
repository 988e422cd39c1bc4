//! The two ordered event queues

use super::timed_event::{EventId, EventPayload, EventType, Priority, TimedEvent};
use crate::broker::{Broker, BrokerEvent};
use crate::clock::Timestamp;
use std::collections::VecDeque;
use tracing::trace;

/// Events sorted ascending by run time
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<TimedEvent>,
}

impl EventQueue {
    /// Insert keeping run-time order; equal run times go after existing ones
    fn insert(&mut self, event: TimedEvent) {
        match self.events.front().map(|e| e.run_time) {
            None => self.events.push_back(event),
            Some(first) if event.run_time < first => self.events.push_front(event),
            Some(_) => {
                // most inserts are for the future, so scan from the tail
                let pos = self
                    .events
                    .iter()
                    .rposition(|e| e.run_time <= event.run_time)
                    .map_or(0, |i| i + 1);
                self.events.insert(pos, event);
            }
        }
    }

    fn remove(&mut self, id: EventId) -> Option<TimedEvent> {
        let pos = self.events.iter().position(|e| e.id == id)?;
        self.events.remove(pos)
    }

    /// Stable re-sort after run times were edited in place
    fn resort(&mut self) {
        self.events
            .make_contiguous()
            .sort_by_key(|e| e.run_time);
    }

    pub fn peek(&self) -> Option<&TimedEvent> {
        self.events.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimedEvent> {
        self.events.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut TimedEvent> {
        self.events.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// High and low priority timelines
#[derive(Debug)]
pub struct Timeline {
    high: EventQueue,
    low: EventQueue,
    next_id: EventId,
    broker: Broker,
}

impl Timeline {
    pub fn new(broker: Broker) -> Self {
        Self {
            high: EventQueue::default(),
            low: EventQueue::default(),
            next_id: 0,
            broker,
        }
    }

    pub fn queue(&self, priority: Priority) -> &EventQueue {
        match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        }
    }

    pub(crate) fn queue_mut(&mut self, priority: Priority) -> &mut EventQueue {
        match priority {
            Priority::High => &mut self.high,
            Priority::Low => &mut self.low,
        }
    }

    /// Queue an event, assigning it an id if it has none
    pub fn add_event(&mut self, mut event: TimedEvent, priority: Priority) -> EventId {
        if event.id == 0 {
            self.next_id += 1;
            event.id = self.next_id;
        }
        let id = event.id;
        trace!(
            "Scheduling {} event {} at {} ({:?})",
            event.event_type,
            id,
            event.run_time,
            priority
        );
        self.broker.publish(BrokerEvent::TimedEventAdded {
            id,
            event_type: event.event_type,
            run_time: event.run_time,
        });
        self.queue_mut(priority).insert(event);
        id
    }

    /// Remove one event by identity
    pub fn remove_event(&mut self, id: EventId) -> Option<TimedEvent> {
        let event = self.high.remove(id).or_else(|| self.low.remove(id))?;
        self.broker.publish(BrokerEvent::TimedEventRemoved {
            id,
            event_type: event.event_type,
        });
        Some(event)
    }

    /// Remove every event of a type acting on a payload
    pub fn remove_events(&mut self, event_type: EventType, payload: &EventPayload) -> usize {
        let ids: Vec<EventId> = self
            .high
            .iter()
            .chain(self.low.iter())
            .filter(|e| e.event_type == event_type && e.payload.matches(payload))
            .map(|e| e.id)
            .collect();
        ids.into_iter()
            .filter(|id| self.remove_event(*id).is_some())
            .count()
    }

    /// Remove every event of the given types regardless of payload
    pub fn remove_all_of(&mut self, types: &[EventType]) -> usize {
        let ids: Vec<EventId> = self
            .high
            .iter()
            .chain(self.low.iter())
            .filter(|e| types.contains(&e.event_type))
            .map(|e| e.id)
            .collect();
        ids.into_iter()
            .filter(|id| self.remove_event(*id).is_some())
            .count()
    }

    /// First queued event of a type acting on a payload
    pub fn find_event(
        &self,
        event_type: EventType,
        payload: &EventPayload,
    ) -> Option<(&TimedEvent, Priority)> {
        self.high
            .iter()
            .map(|e| (e, Priority::High))
            .chain(self.low.iter().map(|e| (e, Priority::Low)))
            .find(|(e, _)| e.event_type == event_type && e.payload.matches(payload))
    }

    /// Pop the head of a queue if it is due
    pub fn pop_due(&mut self, priority: Priority, now: Timestamp) -> Option<TimedEvent> {
        let queue = self.queue_mut(priority);
        if queue.peek()?.run_time <= now {
            queue.events.pop_front()
        } else {
            None
        }
    }

    /// Re-queue a recurring event at its next run time
    pub fn reschedule_event(&mut self, mut event: TimedEvent, priority: Priority, now: Timestamp) {
        if !event.recurring {
            return;
        }
        event.run_time = match &event.timing_func {
            Some(timing) => timing(now),
            None => event.run_time + event.event_interval,
        };
        if event.run_time < now {
            event.run_time = now;
        }
        self.add_event(event, priority);
    }

    /// Re-sort both queues after run times were edited in place
    pub fn resort(&mut self) {
        self.high.resort();
        self.low.resort();
    }

    pub(crate) fn resort_queue(&mut self, priority: Priority) {
        self.queue_mut(priority).resort();
    }

    /// Both queues empty
    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.low.len()
    }

    /// Earliest run time across both queues
    pub fn next_run_time(&self) -> Option<Timestamp> {
        let high = self.high.peek().map(|e| e.run_time);
        let low = self.low.peek().map(|e| e.run_time);
        match (high, low) {
            (Some(h), Some(l)) => Some(h.min(l)),
            (h, l) => h.or(l),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn run_times(timeline: &Timeline, priority: Priority) -> Vec<Timestamp> {
        timeline.queue(priority).iter().map(|e| e.run_time).collect()
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut timeline = Timeline::new(Broker::default());
        for t in [50, 10, 30, 30, 5, 70] {
            timeline.add_event(TimedEvent::new(EventType::StatusSave, t), Priority::Low);
        }
        assert_eq!(run_times(&timeline, Priority::Low), vec![5, 10, 30, 30, 50, 70]);
        assert!(timeline.queue(Priority::High).is_empty());
    }

    #[test]
    fn test_equal_times_insert_after_existing() {
        let mut timeline = Timeline::new(Broker::default());
        let a = timeline.add_event(TimedEvent::new(EventType::StatusSave, 10), Priority::High);
        let b = timeline.add_event(TimedEvent::new(EventType::StatusSave, 10), Priority::High);
        let ids: Vec<EventId> = timeline.queue(Priority::High).iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_remove_by_identity_and_payload() {
        let mut timeline = Timeline::new(Broker::default());
        let keep = timeline.add_event(
            TimedEvent::new(EventType::ScheduledDowntime, 10).with_payload(EventPayload::Downtime(1)),
            Priority::High,
        );
        timeline.add_event(
            TimedEvent::new(EventType::ScheduledDowntime, 20).with_payload(EventPayload::Downtime(2)),
            Priority::High,
        );
        timeline.add_event(
            TimedEvent::new(EventType::ScheduledDowntime, 30).with_payload(EventPayload::Downtime(2)),
            Priority::Low,
        );

        assert_eq!(
            timeline.remove_events(EventType::ScheduledDowntime, &EventPayload::Downtime(2)),
            2
        );
        assert_eq!(timeline.len(), 1);
        assert!(timeline.remove_event(keep).is_some());
        assert!(timeline.remove_event(keep).is_none());
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_pop_due() {
        let mut timeline = Timeline::new(Broker::default());
        timeline.add_event(TimedEvent::new(EventType::CheckReaper, 100), Priority::High);
        assert!(timeline.pop_due(Priority::High, 99).is_none());
        assert!(timeline.pop_due(Priority::High, 100).is_some());
        assert!(timeline.pop_due(Priority::Low, 100).is_none());
    }

    #[test]
    fn test_reschedule_clamps_to_now() {
        let mut timeline = Timeline::new(Broker::default());
        let event = TimedEvent::new(EventType::CheckReaper, 100).recurring(10);
        timeline.reschedule_event(event, Priority::High, 500);
        assert_eq!(run_times(&timeline, Priority::High), vec![500]);

        let event = TimedEvent::new(EventType::CheckReaper, 100).recurring(10);
        timeline.reschedule_event(event, Priority::High, 105);
        assert_eq!(run_times(&timeline, Priority::High), vec![110, 500]);
    }

    #[test]
    fn test_reschedule_uses_timing_function() {
        let mut timeline = Timeline::new(Broker::default());
        let event = TimedEvent::new(EventType::LogRotation, 100)
            .recurring(0)
            .with_timing(Arc::new(|now| now + 3600));
        timeline.reschedule_event(event, Priority::High, 200);
        assert_eq!(run_times(&timeline, Priority::High), vec![3800]);
    }

    #[test]
    fn test_non_recurring_is_dropped() {
        let mut timeline = Timeline::new(Broker::default());
        timeline.reschedule_event(TimedEvent::new(EventType::Sleep, 1), Priority::High, 2);
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_next_run_time() {
        let mut timeline = Timeline::new(Broker::default());
        assert_eq!(timeline.next_run_time(), None);
        timeline.add_event(TimedEvent::new(EventType::StatusSave, 40), Priority::High);
        timeline.add_event(TimedEvent::new(EventType::StatusSave, 20), Priority::Low);
        assert_eq!(timeline.next_run_time(), Some(20));
    }
}
