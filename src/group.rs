//! Consumer-group coordination: membership, partition assignment and
//! ownership leases.
//!
//! Every membership change bumps the group generation and recomputes a
//! round-robin assignment over the members sorted by id. A member learns
//! its assignment through a `watch` channel but may only touch a partition
//! after [`Membership::acquire`] grants it a [`Lease`]. A lease is granted
//! only once the previous holder has released the partition, so the old
//! owner always stops before the new owner starts. Each grant carries a
//! fresh per-partition epoch; writes made with an older epoch are fenced by
//! the broker.
//!
//! ```text
//! join ──► generation+1 ──► Assignment{generation, partitions} ──► member
//!                                                                   │
//!            acquire(p) waits while another member holds p ◄────────┘
//!            release(lease) / leave ──► waiters wake up
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::LogError;

/// The partitions a member should own in a given generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    /// Group generation this assignment belongs to.
    pub generation: u64,
    /// Partition numbers assigned to the member.
    pub partitions: BTreeSet<u32>,
}

/// Exclusive, fenced ownership of one partition for one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Group the lease was granted in.
    pub group: String,
    /// Member holding the lease.
    pub member: String,
    /// Partition number.
    pub partition: u32,
    /// Strictly increasing per partition across all grants.
    pub epoch: u64,
}

/// Snapshot of a group's state, for inspection and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDescription {
    /// Current generation.
    pub generation: u64,
    /// Target assignment per member id.
    pub members: BTreeMap<String, BTreeSet<u32>>,
    /// Current lease holder per partition.
    pub holders: BTreeMap<u32, String>,
}

#[derive(Debug, Clone)]
struct Holder {
    member: String,
    epoch: u64,
}

struct GroupState {
    generation: u64,
    partitions: u32,
    members: BTreeMap<String, watch::Sender<Assignment>>,
    holders: HashMap<u32, Holder>,
    epochs: HashMap<u32, u64>,
}

impl GroupState {
    fn new(partitions: u32) -> Self {
        Self {
            generation: 0,
            partitions,
            members: BTreeMap::new(),
            holders: HashMap::new(),
            epochs: HashMap::new(),
        }
    }

    fn rebalance(&mut self, group: &str) {
        self.generation = self.generation.checked_add(1).unwrap_or_else(|| {
            tracing::warn!(group, "group generation wrapped");
            1
        });

        let ids: Vec<&String> = self.members.keys().collect();
        let mut targets: BTreeMap<&String, BTreeSet<u32>> =
            ids.iter().map(|id| (*id, BTreeSet::new())).collect();
        if !ids.is_empty() {
            for p in 0..self.partitions {
                let owner = ids[p as usize % ids.len()];
                targets.entry(owner).or_default().insert(p);
            }
        }

        for (id, sender) in &self.members {
            let partitions = targets.remove(id).unwrap_or_default();
            tracing::debug!(group, member = %id, generation = self.generation, ?partitions, "assignment");
            sender.send_replace(Assignment {
                generation: self.generation,
                partitions,
            });
        }
    }

    fn is_assigned(&self, member: &str, partition: u32) -> bool {
        self.members
            .get(member)
            .is_some_and(|tx| tx.borrow().partitions.contains(&partition))
    }
}

struct CoordinatorInner {
    groups: Mutex<HashMap<String, GroupState>>,
    /// Bumped on every state change; waiters in `acquire` subscribe to it.
    changed: watch::Sender<u64>,
}

/// Coordinates partition ownership for every group on a broker.
///
/// `Clone` is cheap: the state is shared behind an `Arc`.
#[derive(Clone)]
pub struct GroupCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for GroupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupCoordinator {
    /// Create a coordinator with no groups.
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(CoordinatorInner {
                groups: Mutex::new(HashMap::new()),
                changed,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, GroupState>> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner
            .groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.inner.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Join `group`, which distributes `partitions` partitions among its
    /// members.
    ///
    /// Triggers a rebalance. The returned [`Membership`] leaves the group
    /// when dropped.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::PartitionCountMismatch`] if the group already
    /// exists with a different partition count.
    pub fn join(&self, group: &str, partitions: u32) -> Result<Membership, LogError> {
        let member = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = watch::channel(Assignment::default());
        {
            let mut groups = self.lock();
            let state = groups
                .entry(group.to_string())
                .or_insert_with(|| GroupState::new(partitions));
            if state.partitions != partitions {
                return Err(LogError::PartitionCountMismatch {
                    topic: group.to_string(),
                    existing: state.partitions,
                    requested: partitions,
                });
            }
            state.members.insert(member.clone(), tx);
            state.rebalance(group);
        }
        self.notify();
        tracing::info!(group, member = %member, "joined group");

        Ok(Membership {
            coordinator: self.clone(),
            group: group.to_string(),
            member,
            assignment: rx,
        })
    }

    /// Returns `true` if `lease` is still the current grant for its partition.
    pub fn is_current(&self, lease: &Lease) -> bool {
        let groups = self.lock();
        groups
            .get(&lease.group)
            .and_then(|state| state.holders.get(&lease.partition))
            .is_some_and(|h| h.member == lease.member && h.epoch == lease.epoch)
    }

    /// Describe a group, or `None` if nobody ever joined it.
    pub fn describe(&self, group: &str) -> Option<GroupDescription> {
        let groups = self.lock();
        let state = groups.get(group)?;
        Some(GroupDescription {
            generation: state.generation,
            members: state
                .members
                .iter()
                .map(|(id, tx)| (id.clone(), tx.borrow().partitions.clone()))
                .collect(),
            holders: state
                .holders
                .iter()
                .map(|(p, h)| (*p, h.member.clone()))
                .collect(),
        })
    }

    fn leave(&self, group: &str, member: &str) {
        {
            let mut groups = self.lock();
            let Some(state) = groups.get_mut(group) else {
                return;
            };
            if state.members.remove(member).is_none() {
                return;
            }
            state.holders.retain(|_, h| h.member != member);
            state.rebalance(group);
        }
        self.notify();
        tracing::info!(group, member, "left group");
    }

    /// Drop the lease held on `partition` without its holder's consent.
    #[cfg(test)]
    pub(crate) fn expire_lease(&self, group: &str, partition: u32) {
        if let Some(state) = self.lock().get_mut(group) {
            state.holders.remove(&partition);
        }
        self.notify();
    }
}

/// A member's handle on its group.
///
/// Dropping the membership leaves the group: all leases it still holds are
/// dropped and the remaining members are rebalanced.
pub struct Membership {
    coordinator: GroupCoordinator,
    group: String,
    member: String,
    assignment: watch::Receiver<Assignment>,
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("group", &self.group)
            .field("member", &self.member)
            .finish()
    }
}

impl Membership {
    /// This member's id.
    pub fn member_id(&self) -> &str {
        &self.member
    }

    /// The group name.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The latest assignment published to this member.
    pub fn assignment(&self) -> Assignment {
        self.assignment.borrow().clone()
    }

    /// A receiver of assignment changes, for callers that share the
    /// membership behind an `Arc`.
    pub fn watch_assignment(&self) -> watch::Receiver<Assignment> {
        self.assignment.clone()
    }

    /// Wait for the next assignment change and return it.
    ///
    /// Returns `None` once the member is no longer part of the group.
    pub async fn next_assignment(&mut self) -> Option<Assignment> {
        self.assignment.changed().await.ok()?;
        Some(self.assignment.borrow_and_update().clone())
    }

    /// Acquire exclusive ownership of `partition`.
    ///
    /// Waits while another member still holds the partition. Re-acquiring a
    /// partition this member already holds returns the existing lease.
    ///
    /// # Errors
    ///
    /// * [`LogError::Revoked`] -- the partition is not (or no longer)
    ///   assigned to this member.
    /// * [`LogError::NotMember`] -- the member has left the group.
    pub async fn acquire(&self, partition: u32) -> Result<Lease, LogError> {
        // Subscribe before inspecting state so a release between the check
        // and the wait is not missed.
        let mut changed = self.coordinator.inner.changed.subscribe();
        loop {
            {
                let mut groups = self.coordinator.lock();
                let state = groups
                    .get_mut(&self.group)
                    .ok_or_else(|| LogError::NotMember(self.member.clone()))?;
                if !state.members.contains_key(&self.member) {
                    return Err(LogError::NotMember(self.member.clone()));
                }
                if !state.is_assigned(&self.member, partition) {
                    return Err(LogError::Revoked {
                        partition,
                        member: self.member.clone(),
                    });
                }
                match state.holders.get(&partition) {
                    Some(h) if h.member == self.member => {
                        return Ok(self.lease(partition, h.epoch));
                    }
                    Some(h) => {
                        tracing::debug!(
                            group = %self.group,
                            partition,
                            holder = %h.member,
                            "waiting for previous owner to release"
                        );
                    }
                    None => {
                        let epoch = state.epochs.entry(partition).or_insert(0);
                        *epoch += 1;
                        let epoch = *epoch;
                        state.holders.insert(
                            partition,
                            Holder {
                                member: self.member.clone(),
                                epoch,
                            },
                        );
                        drop(groups);
                        self.coordinator.notify();
                        tracing::debug!(group = %self.group, partition, epoch, "lease granted");
                        return Ok(self.lease(partition, epoch));
                    }
                }
            }
            if changed.changed().await.is_err() {
                return Err(LogError::NotMember(self.member.clone()));
            }
        }
    }

    /// Release a lease so the partition's next owner may acquire it.
    ///
    /// Releasing a stale lease is a no-op.
    pub fn release(&self, lease: &Lease) {
        let released = {
            let mut groups = self.coordinator.lock();
            match groups.get_mut(&lease.group) {
                Some(state) => {
                    let current = state
                        .holders
                        .get(&lease.partition)
                        .is_some_and(|h| h.member == lease.member && h.epoch == lease.epoch);
                    if current {
                        state.holders.remove(&lease.partition);
                    }
                    current
                }
                None => false,
            }
        };
        if released {
            self.coordinator.notify();
            tracing::debug!(
                group = %lease.group,
                partition = lease.partition,
                epoch = lease.epoch,
                "lease released"
            );
        }
    }

    fn lease(&self, partition: u32, epoch: u64) -> Lease {
        Lease {
            group: self.group.clone(),
            member: self.member.clone(),
            partition,
            epoch,
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.coordinator.leave(&self.group, &self.member);
    }
}
