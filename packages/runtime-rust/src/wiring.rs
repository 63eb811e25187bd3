//! Resolved wiring of one artifact: the declared edges between service
//! instances and the channels currently open for them.
//!
//! A channel opens when the first of its endpoints starts and closes as soon
//! as either endpoint stops. An edge whose channel was closed stays in the
//! graph; it is not reopened for the same pair of instances.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use flowyard_core::{ChannelId, ServiceId};
use tracing::debug;

use crate::channel::RecordChannel;
use crate::instance::ServiceInstance;

/// Channel geometry applied to every channel the graph opens.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelSettings {
    pub capacity: usize,
    pub enqueue_timeout: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct WiringGraph {
    edges: Vec<ChannelId>,
    live: HashMap<ChannelId, Arc<RecordChannel>>,
    closed: HashSet<ChannelId>,
}

impl WiringGraph {
    pub(crate) fn new(edges: Vec<ChannelId>) -> Self {
        Self {
            edges,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub(crate) fn edges(&self) -> &[ChannelId] {
        &self.edges
    }

    /// Opens the channels of every edge touching `service` that are not open
    /// yet, provided neither endpoint is retiring, and binds them to both
    /// endpoints. Returns the number of channels opened.
    pub(crate) fn open_for(
        &mut self,
        service: &ServiceId,
        settings: ChannelSettings,
        lookup: impl Fn(&ServiceId) -> Option<Arc<ServiceInstance>>,
    ) -> usize {
        let mut opened = 0;
        for edge in self.edges.iter().filter(|e| e.touches(service)) {
            if self.live.contains_key(edge) || self.closed.contains(edge) {
                continue;
            }
            let (Some(producer), Some(consumer)) = (lookup(&edge.producer), lookup(&edge.consumer))
            else {
                continue;
            };
            if producer.is_retiring() || consumer.is_retiring() {
                continue;
            }
            let Some(port) = producer.output_port(&edge.output) else {
                continue;
            };

            let channel = Arc::new(RecordChannel::new(
                edge.clone(),
                settings.capacity,
                settings.enqueue_timeout,
            ));
            port.bind(channel.clone());
            consumer.bind_input(&edge.input, channel.clone());
            self.live.insert(edge.clone(), channel);
            debug!(channel = %edge, "channel opened");
            opened += 1;
        }
        opened
    }

    /// Closes every open channel touching `service`. Producers keep the
    /// closed channel bound, so their next emit fails with `ChannelClosed`.
    pub(crate) fn close_for(&mut self, service: &ServiceId) -> usize {
        let ids: Vec<ChannelId> = self
            .live
            .keys()
            .filter(|id| id.touches(service))
            .cloned()
            .collect();
        for id in &ids {
            if let Some(channel) = self.live.remove(id) {
                channel.close();
            }
            self.closed.insert(id.clone());
        }
        ids.len()
    }

    /// Adds a copy of every edge of `source` with `clone` in its place.
    pub(crate) fn duplicate_for(&mut self, source: &ServiceId, clone: &ServiceId) -> usize {
        let copies: Vec<ChannelId> = self
            .edges
            .iter()
            .filter(|e| e.touches(source))
            .map(|e| substitute(e, source, clone))
            .filter(|e| !self.edges.contains(e))
            .collect();
        let added = copies.len();
        self.edges.extend(copies);
        added
    }

    /// Moves every edge of `old` onto `new`. Channels open on those edges are
    /// closed and detached from the surviving endpoints; their buffered
    /// records are discarded.
    pub(crate) fn repoint(
        &mut self,
        old: &ServiceId,
        new: &ServiceId,
        lookup: impl Fn(&ServiceId) -> Option<Arc<ServiceInstance>>,
    ) {
        for edge in &mut self.edges {
            if !edge.touches(old) {
                continue;
            }
            let current = edge.clone();
            if let Some(channel) = self.live.remove(&current) {
                channel.close();
                if let Some(producer) = lookup(&current.producer) {
                    producer.unbind_outputs(&current);
                }
                if let Some(consumer) = lookup(&current.consumer) {
                    consumer.unbind_input(&current);
                }
            }
            self.closed.remove(&current);
            *edge = substitute(&current, old, new);
        }
    }

    /// Orders `services` so producers come before their consumers. Services
    /// on a cycle keep their relative order from `services` and follow the
    /// acyclic part.
    pub(crate) fn dependency_order(&self, services: &[ServiceId]) -> Vec<ServiceId> {
        let position: HashMap<&ServiceId, usize> =
            services.iter().enumerate().map(|(i, s)| (s, i)).collect();
        let mut indegree = vec![0usize; services.len()];
        let mut consumers: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

        for edge in &self.edges {
            let (Some(&p), Some(&c)) = (position.get(&edge.producer), position.get(&edge.consumer))
            else {
                continue;
            };
            if p == c {
                continue;
            }
            let targets = consumers.entry(p).or_default();
            if !targets.contains(&c) {
                targets.push(c);
                indegree[c] += 1;
            }
        }

        let mut ready: VecDeque<usize> = (0..services.len()).filter(|&i| indegree[i] == 0).collect();
        let mut placed = vec![false; services.len()];
        let mut order = Vec::with_capacity(services.len());
        while let Some(next) = ready.pop_front() {
            placed[next] = true;
            order.push(services[next].clone());
            for &c in consumers.get(&next).into_iter().flatten() {
                indegree[c] -= 1;
                if indegree[c] == 0 {
                    ready.push_back(c);
                }
            }
        }
        order.extend(
            services
                .iter()
                .zip(&placed)
                .filter(|(_, done)| !**done)
                .map(|(s, _)| s.clone()),
        );
        order
    }
}

fn substitute(edge: &ChannelId, from: &ServiceId, to: &ServiceId) -> ChannelId {
    let swap = |s: &ServiceId| if s == from { to.clone() } else { s.clone() };
    ChannelId {
        producer: swap(&edge.producer),
        output: edge.output.clone(),
        consumer: swap(&edge.consumer),
        input: edge.input.clone(),
    }
}
