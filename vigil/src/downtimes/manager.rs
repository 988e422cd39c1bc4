//! Downtime manager
//!
//! Owns every scheduled downtime, ordered by start time (entries sharing a
//! start time keep insertion order). All lifecycle operations go through
//! here so trigger cascades can see the whole collection.

use super::downtime::{Downtime, DowntimeContext, DowntimeKind, DowntimeRecord, DowntimeRequest};
use crate::broker::{BrokerEvent, StopReason};
use crate::clock::Timestamp;
use crate::error::{EngineError, Result};
use crate::events::{EventPayload, EventType};
use crate::objects::ObjectRef;
use tracing::{debug, info, warn};

/// Filter for bulk deletion. Unset (or empty) fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DowntimeFilter {
    pub host_name: Option<String>,
    pub service_description: Option<String>,
    pub start_time: Option<Timestamp>,
    pub comment: Option<String>,
}

impl DowntimeFilter {
    fn host_name(&self) -> Option<&str> {
        self.host_name.as_deref().filter(|s| !s.is_empty())
    }

    fn service_description(&self) -> Option<&str> {
        self.service_description.as_deref().filter(|s| !s.is_empty())
    }

    fn start_time(&self) -> Option<Timestamp> {
        self.start_time.filter(|t| *t != 0)
    }

    fn comment(&self) -> Option<&str> {
        self.comment.as_deref().filter(|s| !s.is_empty())
    }

    fn is_unconditional(&self) -> bool {
        self.host_name().is_none()
            && self.service_description().is_none()
            && self.start_time().is_none()
            && self.comment().is_none()
    }

    fn matches(&self, dt: &Downtime) -> bool {
        if let Some(comment) = self.comment() {
            if dt.comment != comment {
                return false;
            }
        }
        if let Some(start) = self.start_time() {
            if dt.start_time != start {
                return false;
            }
        }
        if let Some(host) = self.host_name() {
            if dt.host_name() != host {
                return false;
            }
        }
        match (self.service_description(), dt.service_description()) {
            // a service filter never selects host downtimes
            (Some(_), None) => false,
            (Some(wanted), Some(actual)) => wanted == actual,
            (None, _) => true,
        }
    }
}

/// Collection of scheduled downtimes
#[derive(Debug, Default)]
pub struct DowntimeManager {
    downtimes: Vec<Downtime>,
    next_id: u64,
}

fn kind_matches(kind: Option<DowntimeKind>, dt: &Downtime) -> bool {
    kind.map_or(true, |k| dt.kind() == k)
}

impl DowntimeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Downtimes in start-time order
    pub fn downtimes(&self) -> &[Downtime] {
        &self.downtimes
    }

    pub fn len(&self) -> usize {
        self.downtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downtimes.is_empty()
    }

    fn index_of(&self, kind: Option<DowntimeKind>, id: u64) -> Option<usize> {
        self.downtimes
            .iter()
            .position(|dt| dt.id == id && kind_matches(kind, dt))
    }

    /// Look a downtime up by id, optionally restricted to one kind
    pub fn find_downtime(&self, kind: Option<DowntimeKind>, id: u64) -> Option<&Downtime> {
        self.index_of(kind, id).map(|i| &self.downtimes[i])
    }

    /// Insert keeping start-time order, after entries with the same start
    pub fn insert(&mut self, downtime: Downtime) {
        let pos = self
            .downtimes
            .partition_point(|dt| dt.start_time <= downtime.start_time);
        self.downtimes.insert(pos, downtime);
    }

    /// Next unused id. The counter is seeded lazily from the largest id in
    /// the collection.
    pub fn get_next_downtime_id(&mut self) -> u64 {
        if self.next_id == 0 {
            self.next_id = self.downtimes.iter().map(|dt| dt.id).max().unwrap_or(0);
        }
        self.next_id += 1;
        while self.find_downtime(None, self.next_id).is_some() {
            self.next_id += 1;
        }
        self.next_id
    }

    fn add_new(
        &mut self,
        kind: DowntimeKind,
        request: &DowntimeRequest,
        ctx: &mut DowntimeContext<'_>,
    ) -> Result<&Downtime> {
        if request.triggered_by != 0 && self.find_downtime(None, request.triggered_by).is_none() {
            return Err(EngineError::DanglingTrigger(request.triggered_by));
        }

        let id = self.get_next_downtime_id();
        let downtime = Downtime::new(id, kind, request);
        ctx.broker.publish(BrokerEvent::DowntimeLoaded { id, kind });
        ctx.broker.publish(BrokerEvent::DowntimeAdded {
            id,
            kind,
            host_name: downtime.host_name().to_string(),
            service_description: downtime.service_description().map(str::to_string),
        });
        self.insert(downtime);

        let index = self.index_of(None, id).ok_or(EngineError::DowntimeNotFound(id))?;
        Ok(&self.downtimes[index])
    }

    /// Create a host downtime without scheduling it
    pub fn add_new_host_downtime(
        &mut self,
        request: &DowntimeRequest,
        ctx: &mut DowntimeContext<'_>,
    ) -> Result<&Downtime> {
        if request.host_name.is_empty() {
            return Err(EngineError::EmptyHostName);
        }
        self.add_new(DowntimeKind::Host, request, ctx)
    }

    /// Create a service downtime without scheduling it
    pub fn add_new_service_downtime(
        &mut self,
        request: &DowntimeRequest,
        ctx: &mut DowntimeContext<'_>,
    ) -> Result<&Downtime> {
        let description = request.service_description.as_deref().unwrap_or_default();
        if request.host_name.is_empty() || description.is_empty() {
            return Err(EngineError::EmptyServiceTarget);
        }
        self.add_new(DowntimeKind::Service, request, ctx)
    }

    /// Validate the window, create the downtime and subscribe it
    pub fn schedule_downtime(
        &mut self,
        kind: DowntimeKind,
        request: &DowntimeRequest,
        ctx: &mut DowntimeContext<'_>,
    ) -> Result<u64> {
        if request.start_time >= request.end_time {
            return Err(EngineError::InvalidWindow {
                start: request.start_time,
                end: request.end_time,
            });
        }
        if request.end_time <= ctx.now {
            return Err(EngineError::ExpiredWindow(request.end_time));
        }

        let id = match kind {
            DowntimeKind::Host => self.add_new_host_downtime(request, ctx)?.id,
            DowntimeKind::Service => self.add_new_service_downtime(request, ctx)?.id,
        };
        if let Err(e) = self.register(id, ctx) {
            self.delete_downtime(Some(kind), id, ctx);
            return Err(e);
        }
        Ok(id)
    }

    /// Subscribe an already inserted downtime
    pub fn register(&mut self, id: u64, ctx: &mut DowntimeContext<'_>) -> Result<()> {
        let index = self.index_of(None, id).ok_or(EngineError::DowntimeNotFound(id))?;
        self.downtimes[index].subscribe(ctx)
    }

    /// Activation/deactivation step, run when the downtime's event fires
    pub fn handle(&mut self, id: u64, ctx: &mut DowntimeContext<'_>) -> Result<()> {
        let index = self.index_of(None, id).ok_or(EngineError::DowntimeNotFound(id))?;
        let Some(target) = self.downtimes[index].resolve(ctx.objects) else {
            return Err(self.downtimes[index].target.not_found());
        };

        let dt = &mut self.downtimes[index];
        if !dt.fixed && !dt.start_flex_downtime && !dt.in_effect && ctx.objects.is_healthy(target) {
            debug!("Flexible downtime {} waiting for a problem state", id);
            dt.enter_pending(target, ctx);
            return Ok(());
        }

        if dt.in_effect {
            dt.stop(Some(target), StopReason::Normal, ctx);
            dt.release_pending(Some(target), ctx);
            self.stop_triggered(id, ctx);
            self.delete_downtime(None, id, ctx);
        } else {
            dt.start(target, ctx);

            let children: Vec<u64> = self
                .downtimes
                .iter()
                .filter(|c| c.triggered_by == id)
                .map(|c| c.id)
                .collect();
            for child in children {
                if let Err(e) = self.handle(child, ctx) {
                    warn!("Failed to start downtime {} triggered by {}: {}", child, id, e);
                }
            }
        }
        Ok(())
    }

    /// Stop the active downtimes `id` triggered. A child whose target is
    /// gone cannot stop normally and is discarded instead.
    fn stop_triggered(&mut self, id: u64, ctx: &mut DowntimeContext<'_>) {
        let children: Vec<u64> = self
            .downtimes
            .iter()
            .filter(|c| c.triggered_by == id && c.in_effect)
            .map(|c| c.id)
            .collect();
        for child in children {
            if let Err(e) = self.handle(child, ctx) {
                warn!("Failed to stop downtime {} triggered by {}: {}", child, id, e);
                if let Some(index) = self.index_of(None, child) {
                    self.downtimes[index].stop(None, StopReason::Normal, ctx);
                }
                self.stop_triggered(child, ctx);
                self.delete_downtime(None, child, ctx);
            }
        }
    }

    /// Cancel a downtime and everything it triggered
    pub fn unschedule_downtime(
        &mut self,
        kind: Option<DowntimeKind>,
        id: u64,
        ctx: &mut DowntimeContext<'_>,
    ) -> Result<()> {
        if self.find_downtime(kind, id).is_none() {
            return Err(EngineError::DowntimeNotFound(id));
        }

        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let Some(index) = self.index_of(None, current) else {
                continue;
            };
            let dt = &mut self.downtimes[index];
            let target = dt.resolve(ctx.objects);
            dt.release_pending(target, ctx);
            if dt.in_effect {
                dt.stop(target, StopReason::Cancelled, ctx);
            }
            ctx.events
                .remove_events(EventType::ScheduledDowntime, &EventPayload::Downtime(current));
            self.delete_downtime(None, current, ctx);

            // push in reverse so children are processed in collection order
            let mut children: Vec<u64> = self
                .downtimes
                .iter()
                .filter(|c| c.triggered_by == current)
                .map(|c| c.id)
                .collect();
            children.reverse();
            pending.extend(children);
        }
        Ok(())
    }

    /// Remove a downtime and its comment
    pub fn delete_downtime(
        &mut self,
        kind: Option<DowntimeKind>,
        id: u64,
        ctx: &mut DowntimeContext<'_>,
    ) -> bool {
        let Some(index) = self.index_of(kind, id) else {
            return false;
        };
        let dt = self.downtimes.remove(index);
        if let Some(comment_id) = dt.comment_id {
            if let Err(e) = ctx.comments.delete(comment_id) {
                debug!("Comment {} of downtime {}: {}", comment_id, id, e);
            }
        }
        ctx.events
            .remove_events(EventType::ScheduledDowntime, &EventPayload::Downtime(id));
        ctx.broker.publish(BrokerEvent::DowntimeDeleted {
            id,
            kind: dt.kind(),
        });
        true
    }

    /// Drop downtimes whose window passed without them ever taking effect
    pub fn check_for_expired_downtime(&mut self, ctx: &mut DowntimeContext<'_>) -> usize {
        let expired: Vec<u64> = self
            .downtimes
            .iter()
            .filter(|dt| !dt.in_effect && dt.end_time < ctx.now)
            .map(|dt| dt.id)
            .collect();

        for id in &expired {
            if let Some(index) = self.index_of(None, *id) {
                let dt = &mut self.downtimes[index];
                let target = dt.resolve(ctx.objects);
                dt.release_pending(target, ctx);
                debug!("Expiring downtime {} on '{}'", id, dt.host_name());
            }
            self.delete_downtime(None, *id, ctx);
        }
        expired.len()
    }

    /// Cancel every downtime matching the filter. Refuses an empty filter.
    pub fn delete_downtime_by_hostname_service_description_start_time_comment(
        &mut self,
        filter: &DowntimeFilter,
        ctx: &mut DowntimeContext<'_>,
    ) -> usize {
        debug!("Delete downtimes matching {:?}", filter);
        if filter.is_unconditional() {
            return 0;
        }

        let matching: Vec<(DowntimeKind, u64)> = self
            .downtimes
            .iter()
            .filter(|dt| filter.matches(dt))
            .map(|dt| (dt.kind(), dt.id))
            .collect();

        matching
            .into_iter()
            .filter(|(kind, id)| self.unschedule_downtime(Some(*kind), *id, ctx).is_ok())
            .count()
    }

    /// Start flexible host downtimes now that the host has a problem
    pub fn check_pending_flex_host_downtime(&mut self, host_name: &str, ctx: &mut DowntimeContext<'_>) {
        self.start_pending_flex(host_name, None, ctx);
    }

    /// Start flexible service downtimes now that the service has a problem
    pub fn check_pending_flex_service_downtime(
        &mut self,
        host_name: &str,
        service_description: &str,
        ctx: &mut DowntimeContext<'_>,
    ) {
        self.start_pending_flex(host_name, Some(service_description), ctx);
    }

    fn start_pending_flex(
        &mut self,
        host_name: &str,
        service_description: Option<&str>,
        ctx: &mut DowntimeContext<'_>,
    ) {
        let Some(target) = ctx.objects.resolve(host_name, service_description) else {
            return;
        };
        if ctx.objects.is_healthy(target) {
            return;
        }

        let now = ctx.now;
        let ready: Vec<u64> = self
            .downtimes
            .iter()
            .filter(|dt| {
                !dt.fixed
                    && !dt.in_effect
                    && dt.triggered_by == 0
                    && dt.host_name() == host_name
                    && dt.service_description() == service_description
                    && dt.start_time <= now
                    && now <= dt.end_time
            })
            .map(|dt| dt.id)
            .collect();

        for id in ready {
            debug!("Flexible downtime (id={}) for '{}' starting now...", id, host_name);
            if let Some(index) = self.index_of(None, id) {
                self.downtimes[index].start_flex_downtime = true;
            }
            if let Err(e) = self.handle(id, ctx) {
                warn!("Failed to start flexible downtime {}: {}", id, e);
            }
        }
    }

    /// Startup sweep: drop stale downtimes, then triggered downtimes whose
    /// parent is gone, and reset the id counter
    pub fn initialize_downtime_data(&mut self, ctx: &mut DowntimeContext<'_>) {
        let stale: Vec<u64> = self
            .downtimes
            .iter()
            .filter(|dt| dt.is_stale(ctx.objects, ctx.now))
            .map(|dt| dt.id)
            .collect();
        for id in &stale {
            self.delete_downtime(None, *id, ctx);
        }

        let mut orphans = 0;
        loop {
            let orphan = self
                .downtimes
                .iter()
                .find(|dt| dt.triggered_by != 0 && self.find_downtime(None, dt.triggered_by).is_none())
                .map(|dt| dt.id);
            match orphan {
                Some(id) => {
                    self.delete_downtime(None, id, ctx);
                    orphans += 1;
                }
                None => break,
            }
        }

        if !stale.is_empty() || orphans > 0 {
            info!(
                "Discarded {} stale and {} orphaned downtimes",
                stale.len(),
                orphans
            );
        }
        self.next_id = 0;
    }

    /// Load retained downtimes, validate them and subscribe the survivors
    pub fn apply(&mut self, records: &[DowntimeRecord], ctx: &mut DowntimeContext<'_>) {
        for record in records {
            if self.find_downtime(None, record.downtime_id).is_some() {
                warn!("Ignoring duplicate retained downtime {}", record.downtime_id);
                continue;
            }
            let downtime = Downtime::from_record(record);
            ctx.broker.publish(BrokerEvent::DowntimeLoaded {
                id: downtime.id,
                kind: downtime.kind(),
            });
            self.insert(downtime);
        }

        self.initialize_downtime_data(ctx);

        let ids: Vec<u64> = self.downtimes.iter().map(|dt| dt.id).collect();
        for id in ids {
            if let Err(e) = self.register(id, ctx) {
                warn!("Failed to register retained downtime {}: {}", id, e);
            }
        }
    }

    /// Retention records for every downtime
    pub fn retention_records(&self) -> Vec<DowntimeRecord> {
        self.downtimes.iter().map(Downtime::retention_record).collect()
    }

    /// Downtime ids that cover an object
    pub fn ids_for(&self, host_name: &str, service_description: Option<&str>) -> Vec<u64> {
        self.downtimes
            .iter()
            .filter(|dt| dt.host_name() == host_name && dt.service_description() == service_description)
            .map(|dt| dt.id)
            .collect()
    }

    /// Whether a downtime currently in effect covers `target`
    pub fn target_in_effect(&self, objects: &crate::objects::ObjectStore, target: ObjectRef) -> bool {
        self.downtimes
            .iter()
            .any(|dt| dt.in_effect && dt.resolve(objects) == Some(target))
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.downtimes.clear();
        self.next_id = 0;
    }
}
