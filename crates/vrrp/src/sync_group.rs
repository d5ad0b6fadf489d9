//! Sync-group coordinator (§4.5): holds a named set of instances' collective
//! state so that, for example, an active/passive pair advertising two VIPs
//! over two VRIDs always fails over together rather than splitting.

use std::collections::HashMap;

use crate::types::VrrpState;

/// A state-transition proposal an instance routes through its group
/// (§3 invariant: "instance's own state-transition proposals MUST pass
/// through the group coordinator").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proposal {
    Master,
    Fault,
}

/// What the coordinator tells the proposing instance, and in the `Master`
/// case, every other member, to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Commit immediately; if the proposal was `Master`, every other member
    /// transitions to MASTER too.
    Commit,
    /// Park at `wantstate = MASTER`; stay BACKUP until unblocked.
    Defer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberStatus {
    Init,
    Backup,
    Master,
    Fault,
}

/// Tracks one named sync group's aggregated counters and member states.
/// Grounded on the `num_member_fault`/`num_member_init` gating rule of §4.5.
#[derive(Debug)]
pub struct SyncGroup {
    pub name: String,
    members: HashMap<MemberId, MemberStatus>,
    /// Preserves configured member ordering for the group-wide transition
    /// sequencing guarantee in §5 ("sequenced across members in the order
    /// they appear in the group's member list").
    member_order: Vec<MemberId>,
    pub sgroup_tracking_weight: bool,
}

impl SyncGroup {
    pub fn new(name: impl Into<String>, member_order: Vec<MemberId>, sgroup_tracking_weight: bool) -> Self {
        let members = member_order.iter().copied().map(|m| (m, MemberStatus::Init)).collect();
        Self {
            name: name.into(),
            members,
            member_order,
            sgroup_tracking_weight,
        }
    }

    pub fn member_order(&self) -> &[MemberId] {
        &self.member_order
    }

    fn count(&self, status: MemberStatus) -> usize {
        self.members.values().filter(|s| **s == status).count()
    }

    pub fn num_member_fault(&self) -> usize {
        self.count(MemberStatus::Fault)
    }

    pub fn num_member_init(&self) -> usize {
        self.count(MemberStatus::Init)
    }

    /// Records a member leaving INIT once it has settled into BACKUP for
    /// the first time, so `num_member_init` can reach zero.
    pub fn mark_settled(&mut self, member: MemberId) {
        if let Some(status) = self.members.get_mut(&member) {
            if *status == MemberStatus::Init {
                *status = MemberStatus::Backup;
            }
        }
    }

    /// Evaluates a proposal from `member`. FAULT always commits and is
    /// propagated to the whole group; MASTER commits only when no member is
    /// currently faulting or still initializing.
    pub fn propose(&mut self, member: MemberId, proposal: Proposal) -> (Decision, Vec<MemberId>) {
        match proposal {
            Proposal::Fault => {
                self.members.insert(member, MemberStatus::Fault);
                let others: Vec<MemberId> = self
                    .member_order
                    .iter()
                    .copied()
                    .filter(|m| *m != member)
                    .collect();
                for other in &others {
                    self.members.insert(*other, MemberStatus::Fault);
                }
                (Decision::Commit, others)
            }
            Proposal::Master => {
                if self.num_member_fault() == 0 && self.num_member_init() == 0 {
                    for status in self.members.values_mut() {
                        *status = MemberStatus::Master;
                    }
                    let others: Vec<MemberId> = self
                        .member_order
                        .iter()
                        .copied()
                        .filter(|m| *m != member)
                        .collect();
                    (Decision::Commit, others)
                } else {
                    (Decision::Defer, Vec::new())
                }
            }
        }
    }

    /// Called once a blocking condition clears (a faulting/initializing
    /// member recovers) so any deferred MASTER proposal can be retried by
    /// the caller; returns true if the group is now unblocked.
    pub fn is_unblocked_for_master(&self) -> bool {
        self.num_member_fault() == 0 && self.num_member_init() == 0
    }

    pub fn status_of(&self, member: MemberId) -> Option<VrrpState> {
        self.members.get(&member).map(|s| match s {
            MemberStatus::Init => VrrpState::Init,
            MemberStatus::Backup => VrrpState::Backup,
            MemberStatus::Master => VrrpState::Master,
            MemberStatus::Fault => VrrpState::Fault,
        })
    }
}
