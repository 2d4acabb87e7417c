//! Local copy of the remote devices, refreshed from the relay server.
//!
//! The device list lives behind one `Arc<Vec<_>>` that is swapped as a
//! whole, so readers always see a complete list. Joint merges follow a
//! fixed policy:
//!
//! - same joint count: joints are replaced index by index and the
//!   collection keeps its id ([`CacheEvent::Updated`] per index)
//! - different count: the collection is rebuilt under a fresh id
//!   ([`CacheEvent::Reset`])

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, broadcast};

use crate::protocol::{JointSnapshot, RemoteDeviceSnapshot};

const EVENT_CAPACITY: usize = 256;

/// Change notification for observers bound to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// The device list itself was swapped.
    DevicesReplaced,
    /// One device's joint collection was rebuilt.
    Reset { guid: String },
    /// One joint was replaced in place.
    Updated { guid: String, index: usize },
}

/// How a joint merge was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    InPlace,
    Rebuilt,
}

/// A device's joints plus the identity of the collection holding them.
#[derive(Debug, Clone, PartialEq)]
pub struct JointCollection {
    id: u64,
    joints: Vec<JointSnapshot>,
}

impl JointCollection {
    /// Identity of the collection; unchanged by in-place merges.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn joints(&self) -> &[JointSnapshot] {
        &self.joints
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedDevice {
    /// Device state; `snapshot.joints` mirrors `joints`.
    pub snapshot: RemoteDeviceSnapshot,
    pub joints: JointCollection,
}

impl CachedDevice {
    pub fn guid(&self) -> &str {
        &self.snapshot.guid
    }
}

// ── DeviceSnapshotCache ──────────────────────────────────────────

#[derive(Debug)]
pub struct DeviceSnapshotCache {
    devices: RwLock<Arc<Vec<CachedDevice>>>,
    next_collection: AtomicU64,
    events: broadcast::Sender<CacheEvent>,
}

impl DeviceSnapshotCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            devices: RwLock::new(Arc::new(Vec::new())),
            next_collection: AtomicU64::new(1),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// The current list. Later changes do not affect the returned value.
    pub async fn devices(&self) -> Arc<Vec<CachedDevice>> {
        self.devices.read().await.clone()
    }

    pub async fn device(&self, guid: &str) -> Option<CachedDevice> {
        self.devices.read().await.iter().find(|d| d.guid() == guid).cloned()
    }

    /// Plain snapshots of every device, e.g. for persisting.
    pub async fn snapshots(&self) -> Vec<RemoteDeviceSnapshot> {
        self.devices.read().await.iter().map(|d| d.snapshot.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Swap in a new device list.
    ///
    /// Devices already cached follow the merge policy: an unchanged joint
    /// count keeps the collection id and reports every index as updated,
    /// a changed count rebuilds the collection. New devices get a fresh
    /// collection and no per-device event.
    pub async fn replace_all(&self, snapshots: Vec<RemoteDeviceSnapshot>) {
        let mut guard = self.devices.write().await;
        let mut events = Vec::new();
        let next: Vec<CachedDevice> = snapshots
            .into_iter()
            .map(|snapshot| {
                let previous = guard.iter().find(|d| d.guid() == snapshot.guid);
                let id = match previous {
                    Some(prev) if prev.joints.len() == snapshot.joints.len() => {
                        events.extend((0..snapshot.joints.len()).map(|index| CacheEvent::Updated {
                            guid: snapshot.guid.clone(),
                            index,
                        }));
                        prev.joints.id
                    }
                    Some(_) => {
                        events.push(CacheEvent::Reset {
                            guid: snapshot.guid.clone(),
                        });
                        self.fresh_id()
                    }
                    None => self.fresh_id(),
                };
                CachedDevice {
                    joints: JointCollection {
                        id,
                        joints: snapshot.joints.clone(),
                    },
                    snapshot,
                }
            })
            .collect();
        *guard = Arc::new(next);

        // sent under the guard so events stay ordered with the swaps
        for event in events {
            let _ = self.events.send(event);
        }
        let _ = self.events.send(CacheEvent::DevicesReplaced);
    }

    /// Merge freshly pulled joints into one device.
    ///
    /// Returns `None` when the device is not cached.
    pub async fn merge_joints(&self, guid: &str, joints: Vec<JointSnapshot>) -> Option<MergeOutcome> {
        let mut guard = self.devices.write().await;
        let index = guard.iter().position(|d| d.guid() == guid)?;
        let mut next = (**guard).clone();
        let outcome = self.merge_into(&mut next[index], joints);
        *guard = Arc::new(next);
        self.announce(guid, outcome, guard[index].joints.len());
        Some(outcome)
    }

    /// Replace one device's state and merge its joints in one swap.
    pub async fn update_snapshot(&self, mut snapshot: RemoteDeviceSnapshot) -> Option<MergeOutcome> {
        let mut guard = self.devices.write().await;
        let index = guard.iter().position(|d| d.guid() == snapshot.guid)?;
        let mut next = (**guard).clone();

        let joints = std::mem::take(&mut snapshot.joints);
        let device = &mut next[index];
        device.snapshot = snapshot;
        let outcome = self.merge_into(device, joints);

        *guard = Arc::new(next);
        self.announce(guard[index].guid(), outcome, guard[index].joints.len());
        Some(outcome)
    }

    fn merge_into(&self, device: &mut CachedDevice, joints: Vec<JointSnapshot>) -> MergeOutcome {
        device.snapshot.skeleton_tracked = !joints.is_empty();
        let outcome = if device.joints.len() != joints.len() {
            device.joints = JointCollection {
                id: self.fresh_id(),
                joints,
            };
            MergeOutcome::Rebuilt
        } else {
            for (slot, joint) in device.joints.joints.iter_mut().zip(joints) {
                *slot = joint;
            }
            MergeOutcome::InPlace
        };
        device.snapshot.joints = device.joints.joints.clone();
        outcome
    }

    fn announce(&self, guid: &str, outcome: MergeOutcome, count: usize) {
        match outcome {
            MergeOutcome::Rebuilt => {
                let _ = self.events.send(CacheEvent::Reset { guid: guid.to_string() });
            }
            MergeOutcome::InPlace => {
                for index in 0..count {
                    let _ = self.events.send(CacheEvent::Updated {
                        guid: guid.to_string(),
                        index,
                    });
                }
            }
        }
    }

    /// Flag a device whose joints could not be pulled.
    pub async fn mark_untracked(&self, guid: &str) -> bool {
        let mut guard = self.devices.write().await;
        let Some(index) = guard.iter().position(|d| d.guid() == guid) else {
            return false;
        };
        if guard[index].snapshot.skeleton_tracked {
            Arc::make_mut(&mut *guard)[index].snapshot.skeleton_tracked = false;
        }
        true
    }

    fn fresh_id(&self) -> u64 {
        self.next_collection.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for DeviceSnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}
