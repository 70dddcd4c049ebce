//! Topic-tagged mutation messages and their application to the local scene.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::protocol::frame::PoseFrame;
use crate::PeerId;

/// Discrete scene mutations carried as JSON over the reliable channel.
///
/// `instance`/`material`/`texture` payloads stay as raw JSON objects: an
/// `*_updated` message carries only the entity id plus the fields that
/// changed, and the scene layer applies whichever setters it recognizes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum ReplicationMessage {
    Avatar {
        url: String,
    },
    InstanceAdded {
        instance: Value,
    },
    #[serde(rename_all = "camelCase")]
    InstanceDeleted {
        id: String,
        asset_id: String,
    },
    InstanceUpdated {
        instance: Value,
    },
    MaterialAdded {
        material: Value,
        #[serde(rename = "type")]
        material_type: String,
    },
    MaterialDeleted {
        id: String,
    },
    MaterialUpdated {
        material: Value,
    },
    TextureUpdated {
        texture: Value,
    },
    /// Header announcing a chunked project transfer of `parts` binary sends.
    Project {
        parts: usize,
    },
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("{topic} message is missing field `{field}`")]
    MissingField {
        topic: &'static str,
        field: &'static str,
    },
    #[error("malformed replication message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Everything the synchronization core needs from the embedding editor.
///
/// Mutation callbacks must be idempotent: membership races (two peers adding
/// the same entity, or a remote apply echoing back through a local change
/// event) mean every one of them can legitimately run twice.
pub trait SceneDelegate: Send + Sync {
    fn peer_joined(&self, peer: &PeerId);
    fn peer_left(&self, peer: &PeerId);
    fn avatar_changed(&self, peer: &PeerId, url: &str);
    fn apply_pose(&self, peer: &PeerId, frame: PoseFrame);

    fn instance_added(&self, instance: &Value);
    fn instance_updated(&self, instance: &Value);
    fn instance_removed(&self, id: &str, asset_id: &str);
    fn material_added(&self, material: &Value, material_type: &str);
    fn material_updated(&self, material: &Value);
    fn material_removed(&self, id: &str);
    fn texture_updated(&self, texture: &Value);

    /// Reassembled project snapshot received from the host.
    fn project_received(&self, peer: &PeerId, project: Bytes);
    /// Current scene serialization, pushed to freshly-joined peers when this
    /// process is the host. `None` skips the transfer.
    fn project_snapshot(&self) -> Option<Bytes>;
    /// Avatar URL announced to peers when their channel opens.
    fn local_avatar_url(&self) -> Option<String>;
}

/// Translates between wire messages and [`SceneDelegate`] calls.
///
/// Tracks which entity ids were touched by remote applies during the current
/// tick so that the change events those applies fire locally do not get
/// broadcast straight back ([`ReplicationProtocol::should_broadcast`]).
pub struct ReplicationProtocol {
    delegate: Arc<dyn SceneDelegate>,
    known_instances: HashSet<String>,
    recently_applied: HashSet<String>,
}

impl ReplicationProtocol {
    pub fn new(delegate: Arc<dyn SceneDelegate>) -> Self {
        Self {
            delegate,
            known_instances: HashSet::new(),
            recently_applied: HashSet::new(),
        }
    }

    pub fn delegate(&self) -> &Arc<dyn SceneDelegate> {
        &self.delegate
    }

    /// Applies a remote mutation to the local scene.
    pub fn apply(&mut self, from: &PeerId, message: ReplicationMessage) -> Result<(), ReplicationError> {
        if let Some(key) = message_key(&message)? {
            self.recently_applied.insert(key);
        }
        match message {
            ReplicationMessage::Avatar { url } => {
                self.delegate.avatar_changed(from, &url);
            }
            ReplicationMessage::InstanceAdded { instance } => {
                let id = require_id("instance_added", &instance)?;
                // Raced with a local add of the same entity: reuse it
                // instead of duplicating.
                if self.known_instances.insert(id.to_string()) {
                    self.delegate.instance_added(&instance);
                } else {
                    debug!(target: "party::replication", %from, id, "instance already present, updating in place");
                    self.delegate.instance_updated(&instance);
                }
            }
            ReplicationMessage::InstanceDeleted { id, asset_id } => {
                self.known_instances.remove(&id);
                self.delegate.instance_removed(&id, &asset_id);
            }
            ReplicationMessage::InstanceUpdated { instance } => {
                require_id("instance_updated", &instance)?;
                self.delegate.instance_updated(&instance);
            }
            ReplicationMessage::MaterialAdded { material, material_type } => {
                require_id("material_added", &material)?;
                self.delegate.material_added(&material, &material_type);
            }
            ReplicationMessage::MaterialDeleted { id } => {
                self.delegate.material_removed(&id);
            }
            ReplicationMessage::MaterialUpdated { material } => {
                require_id("material_updated", &material)?;
                self.delegate.material_updated(&material);
            }
            ReplicationMessage::TextureUpdated { texture } => {
                require_id("texture_updated", &texture)?;
                self.delegate.texture_updated(&texture);
            }
            ReplicationMessage::Project { .. } => {
                // Transfer headers are armed by the coordinator before apply.
            }
        }
        Ok(())
    }

    /// Records a locally-authored entity so later remote adds of the same id
    /// take the update path.
    pub fn note_local_instance(&mut self, id: &str) {
        self.known_instances.insert(id.to_string());
    }

    pub fn forget_local_instance(&mut self, id: &str) {
        self.known_instances.remove(id);
    }

    /// Whether a locally-fired mutation should go out on the wire. Returns
    /// `false` when the entity was just written by a remote apply, which
    /// marks the event as an echo.
    pub fn should_broadcast(&self, message: &ReplicationMessage) -> bool {
        match message_key(message) {
            Ok(Some(key)) => !self.recently_applied.contains(&key),
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Resets echo bookkeeping from the previous tick. Runs at the start of
    /// a tick, not the end, so keys recorded by remote applies stay visible
    /// through the change events the embedding app flushes after the tick
    /// returns.
    pub fn begin_tick(&mut self) {
        self.recently_applied.clear();
    }
}

fn require_id<'a>(topic: &'static str, entity: &'a Value) -> Result<&'a str, ReplicationError> {
    entity
        .get("id")
        .and_then(Value::as_str)
        .ok_or(ReplicationError::MissingField { topic, field: "id" })
}

fn message_key(message: &ReplicationMessage) -> Result<Option<String>, ReplicationError> {
    let key = match message {
        ReplicationMessage::InstanceAdded { instance } => {
            Some(format!("instance:{}", require_id("instance_added", instance)?))
        }
        ReplicationMessage::InstanceUpdated { instance } => {
            Some(format!("instance:{}", require_id("instance_updated", instance)?))
        }
        ReplicationMessage::InstanceDeleted { id, .. } => Some(format!("instance:{id}")),
        ReplicationMessage::MaterialAdded { material, .. } => {
            Some(format!("material:{}", require_id("material_added", material)?))
        }
        ReplicationMessage::MaterialUpdated { material } => {
            Some(format!("material:{}", require_id("material_updated", material)?))
        }
        ReplicationMessage::MaterialDeleted { id } => Some(format!("material:{id}")),
        ReplicationMessage::TextureUpdated { texture } => {
            Some(format!("texture:{}", require_id("texture_updated", texture)?))
        }
        ReplicationMessage::Avatar { .. } | ReplicationMessage::Project { .. } => None,
    };
    Ok(key)
}
