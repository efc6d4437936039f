//! Change publisher: mutation -> fan-out markers.
//!
//! # Responsibility
//! - Compute every channel one entity mutation must notify.
//! - Hand the markers to the transport without waiting for delivery.
//!
//! # Invariants
//! - The self-channel is always notified: `refresh` on create/update,
//!   `remove` on delete.
//! - Collection and association targets always get `refresh`, delete included.
//! - A channel appears at most once per fan-out.
//! - Publishing never fails the caller; problems are logged and skipped.

use crate::broadcast::targets::{BroadcastRegistry, ResolvedTarget};
use crate::model::channel::ChannelId;
use crate::model::entity::{ChangeEvent, ChangeOperation, EntityRecord, EntityRef};
use crate::model::marker::Marker;
use crate::schema::reflect::{AssociationDescriptor, Cardinality};
use crate::schema::resolve::EntityResolver;
use crate::transport::MarkerTransport;
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Post-commit hook contract consumed from the persistence layer.
pub trait CommitHook: Send + Sync {
    fn on_commit(&self, entity: &EntityRecord, operation: ChangeOperation);
}

/// Fan-out engine shared by every request thread.
pub struct ChangePublisher {
    registry: Arc<BroadcastRegistry>,
    resolver: Arc<dyn EntityResolver>,
    transport: Arc<dyn MarkerTransport>,
}

impl ChangePublisher {
    pub fn new(
        registry: Arc<BroadcastRegistry>,
        resolver: Arc<dyn EntityResolver>,
        transport: Arc<dyn MarkerTransport>,
    ) -> Self {
        Self {
            registry,
            resolver,
            transport,
        }
    }

    pub fn registry(&self) -> &BroadcastRegistry {
        &self.registry
    }

    /// Computes the markers for one mutation without sending them.
    pub fn plan_fan_out(&self, entity: &EntityRecord, operation: ChangeOperation) -> Vec<Marker> {
        let mut plan = FanOutPlan::default();
        let self_channel = ChannelId::for_entity(&entity.entity);
        let self_prop = self.registry.self_prop_for(entity.entity_type());
        plan.push(match operation {
            ChangeOperation::Create | ChangeOperation::Update => {
                Marker::refresh(&self_channel, self_prop)
            }
            ChangeOperation::Delete => Marker::remove(&self_channel, self_prop),
        });

        let Some(config) = self.registry.config_for(entity.entity_type()) else {
            return plan.markers;
        };

        for target in &config.targets {
            match target {
                ResolvedTarget::AllCollection => {
                    let channel = ChannelId::for_collection(entity.entity_type());
                    plan.push(Marker::refresh(&channel, config.collection_prop()));
                }
                ResolvedTarget::Association(descriptor) => {
                    for peer in self.resolve_peers(entity, descriptor) {
                        let prop = self.registry.self_prop_for(&peer.entity_type);
                        plan.push(Marker::refresh(&ChannelId::for_entity(&peer), prop));
                    }
                }
                ResolvedTarget::Unresolved(name) => {
                    warn!(
                        "event=publish_change module=broadcast status=skip reason=unknown_association type={} association={}",
                        entity.entity_type(),
                        name
                    );
                }
            }
        }

        plan.markers
    }

    /// Publishes the fan-out of one mutation, best-effort.
    ///
    /// Returns how many markers the transport accepted. Transport outages
    /// drop markers silently; the caller's mutation is never affected.
    pub fn publish_change(&self, entity: &EntityRecord, operation: ChangeOperation) -> usize {
        let markers = self.plan_fan_out(entity, operation);
        let mut accepted = 0;
        for marker in &markers {
            match self.transport.broadcast(marker) {
                Ok(_) => accepted += 1,
                Err(err) => debug!(
                    "event=publish_change module=broadcast status=dropped channel={} error={}",
                    marker.channel_id, err
                ),
            }
        }
        debug!(
            "event=publish_change module=broadcast status=ok entity={} op={} planned={} accepted={}",
            entity.entity,
            operation.as_str(),
            markers.len(),
            accepted
        );
        accepted
    }

    /// Publishes a change known only by type and id.
    ///
    /// The record is looked up for create/update; deletes and lookup misses
    /// publish with the bare ref.
    pub fn publish_event(&self, event: &ChangeEvent) -> usize {
        let found = match event.operation {
            ChangeOperation::Delete => None,
            ChangeOperation::Create | ChangeOperation::Update => {
                self.resolver.find(&event.entity).unwrap_or_else(|err| {
                    debug!(
                        "event=publish_change module=broadcast status=lookup_failed entity={} error={}",
                        event.entity, err
                    );
                    None
                })
            }
        };
        let record = found.unwrap_or_else(|| EntityRecord {
            entity: event.entity.clone(),
            account_id: None,
            attributes: serde_json::Value::Null,
        });
        self.publish_change(&record, event.operation)
    }

    fn resolve_peers(
        &self,
        owner: &EntityRecord,
        descriptor: &AssociationDescriptor,
    ) -> Vec<EntityRef> {
        let resolved = match descriptor.cardinality {
            Cardinality::Singular => self
                .resolver
                .resolve_singular(owner, descriptor)
                .map(|peer| peer.into_iter().collect::<Vec<_>>()),
            Cardinality::Collection => self.resolver.resolve_collection(owner, descriptor),
        };
        match resolved {
            Ok(peers) => peers,
            Err(err) => {
                warn!(
                    "event=publish_change module=broadcast status=skip reason=resolve_failed entity={} association={} error={}",
                    owner.entity, descriptor.name, err
                );
                Vec::new()
            }
        }
    }
}

impl CommitHook for ChangePublisher {
    fn on_commit(&self, entity: &EntityRecord, operation: ChangeOperation) {
        self.publish_change(entity, operation);
    }
}

#[derive(Default)]
struct FanOutPlan {
    seen: HashSet<String>,
    markers: Vec<Marker>,
}

impl FanOutPlan {
    fn push(&mut self, marker: Marker) {
        if self.seen.insert(marker.channel_id.clone()) {
            self.markers.push(marker);
        }
    }
}
