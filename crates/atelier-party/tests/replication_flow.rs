//! End-to-end exercises of the wire vocabulary: chunked project transfer,
//! idempotent mutation application, echo suppression, and the pose path
//! from encoder through jitter buffer to delegate.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::RngCore;
use serde_json::{json, Value};

use atelier_party::protocol::frame::{peek_timestamp, Pose, PoseFrame};
use atelier_party::protocol::replication::{ReplicationProtocol, SceneDelegate};
use atelier_party::session::jitter::JitterBuffer;
use atelier_party::transport::chunk::{split_project, ProjectTransfer};
use atelier_party::{PeerId, ReplicationMessage};

#[derive(Default)]
struct RecordingScene {
    calls: Mutex<Vec<String>>,
}

impl RecordingScene {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl SceneDelegate for RecordingScene {
    fn peer_joined(&self, peer: &PeerId) {
        self.record(format!("joined {peer}"));
    }
    fn peer_left(&self, peer: &PeerId) {
        self.record(format!("left {peer}"));
    }
    fn avatar_changed(&self, peer: &PeerId, url: &str) {
        self.record(format!("avatar {peer} {url}"));
    }
    fn apply_pose(&self, peer: &PeerId, frame: PoseFrame) {
        self.record(format!("pose {peer} {}", frame.timestamp));
    }
    fn instance_added(&self, instance: &Value) {
        self.record(format!("add {}", instance["id"].as_str().unwrap()));
    }
    fn instance_updated(&self, instance: &Value) {
        self.record(format!("update {}", instance["id"].as_str().unwrap()));
    }
    fn instance_removed(&self, id: &str, asset_id: &str) {
        self.record(format!("remove {id} {asset_id}"));
    }
    fn material_added(&self, material: &Value, material_type: &str) {
        self.record(format!(
            "mat-add {} {material_type}",
            material["id"].as_str().unwrap()
        ));
    }
    fn material_updated(&self, material: &Value) {
        self.record(format!("mat-update {}", material["id"].as_str().unwrap()));
    }
    fn material_removed(&self, id: &str) {
        self.record(format!("mat-remove {id}"));
    }
    fn texture_updated(&self, texture: &Value) {
        self.record(format!("tex-update {}", texture["id"].as_str().unwrap()));
    }
    fn project_received(&self, peer: &PeerId, project: Bytes) {
        self.record(format!("project {peer} {}", project.len()));
    }
    fn project_snapshot(&self) -> Option<Bytes> {
        None
    }
    fn local_avatar_url(&self) -> Option<String> {
        None
    }
}

#[test]
fn hundred_kilobyte_project_round_trips_in_fixed_parts() {
    let mut payload = vec![0u8; 100 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);
    let project = Bytes::from(payload);

    let parts = split_project(&project, 16 * 1024);
    assert_eq!(parts.len(), 7);
    assert!(parts[..6].iter().all(|part| part.len() == 16 * 1024));
    assert_eq!(parts[6].len(), 100 * 1024 - 6 * 16 * 1024);

    // header travels as JSON ahead of the binary parts
    let header = serde_json::to_string(&ReplicationMessage::Project { parts: parts.len() }).unwrap();
    let parsed: ReplicationMessage = serde_json::from_str(&header).unwrap();
    let ReplicationMessage::Project { parts: announced } = parsed else {
        panic!("header did not parse as a project message");
    };

    let mut transfer = ProjectTransfer::new(announced, 64 * 1024 * 1024).unwrap();
    let mut reassembled = None;
    for part in parts {
        assert!(reassembled.is_none(), "transfer completed early");
        reassembled = transfer.push(part).unwrap();
    }
    assert_eq!(reassembled, Some(project));
}

#[test]
fn racing_adds_of_the_same_instance_converge() {
    let scene = Arc::new(RecordingScene::default());
    let mut protocol = ReplicationProtocol::new(scene.clone());

    let added = ReplicationMessage::InstanceAdded {
        instance: json!({"id": "chair-1", "assetId": "chair", "position": [0.0, 0.0, 0.0]}),
    };
    let wire = serde_json::to_string(&added).unwrap();
    let from_alice: ReplicationMessage = serde_json::from_str(&wire).unwrap();
    let from_bob: ReplicationMessage = serde_json::from_str(&wire).unwrap();

    protocol.apply(&PeerId::from("alice"), from_alice).unwrap();
    protocol.apply(&PeerId::from("bob"), from_bob).unwrap();
    protocol
        .apply(
            &PeerId::from("bob"),
            ReplicationMessage::InstanceDeleted {
                id: "chair-1".into(),
                asset_id: "chair".into(),
            },
        )
        .unwrap();

    assert_eq!(
        scene.calls(),
        vec!["add chair-1", "update chair-1", "remove chair-1 chair"]
    );
}

#[test]
fn remote_apply_does_not_echo_back_within_the_tick() {
    let scene = Arc::new(RecordingScene::default());
    let mut protocol = ReplicationProtocol::new(scene);

    let update = ReplicationMessage::MaterialUpdated {
        material: json!({"id": "m-4", "roughness": 0.2}),
    };
    protocol.apply(&PeerId::from("bob"), update.clone()).unwrap();

    // applying the update fired the local change event; it must not rebroadcast
    assert!(!protocol.should_broadcast(&update));
    // a genuinely new local mutation in the same tick still goes out
    assert!(protocol.should_broadcast(&ReplicationMessage::MaterialUpdated {
        material: json!({"id": "m-5", "roughness": 0.8}),
    }));

    protocol.begin_tick();
    assert!(protocol.should_broadcast(&update));
}

#[test]
fn pose_path_delivers_only_the_freshest_due_frame() {
    let scene = RecordingScene::default();
    let peer = PeerId::from("bob");
    let mut jitter = JitterBuffer::new(50);

    let encoded: Vec<Bytes> = [1000u16, 1020, 1040, 1060]
        .into_iter()
        .map(|timestamp| {
            PoseFrame {
                timestamp,
                avatar: Some(Pose {
                    position: [timestamp as f32, 0.0, 0.0],
                    rotation: [0.0, 0.0, 0.0, 1.0],
                }),
                ..Default::default()
            }
            .encode()
        })
        .collect();

    let mut deliver = |jitter: &mut JitterBuffer, now: u16| {
        if let Some((_, payload)) = jitter.pop_due(now) {
            let frame = PoseFrame::decode(&payload).unwrap();
            scene.apply_pose(&peer, frame);
        }
    };

    // nothing has arrived yet; ticks at 1050..=1100 drain nothing
    let mut now = 1050u16;
    while now <= 1100 {
        deliver(&mut jitter, now);
        now += 10;
    }
    assert!(scene.calls().is_empty());

    // the transport delivers all four frames in one reordered clump
    for index in [2usize, 0, 3, 1] {
        let payload = encoded[index].clone();
        let timestamp = peek_timestamp(&payload).unwrap();
        jitter.push(timestamp, payload);
    }

    deliver(&mut jitter, 1110);
    deliver(&mut jitter, 1120);

    // only the freshest frame of the clump survives
    assert_eq!(scene.calls(), vec!["pose bob 1060"]);
}
