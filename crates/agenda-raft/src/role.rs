/// A node's current position in the consensus protocol. Every node starts as
/// a `Follower`; a node only becomes `Leader` after winning an election as
/// `Candidate`, and steps back down to `Follower` the moment it observes a
/// term higher than its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Default for Role {
    fn default() -> Self {
        Role::Follower
    }
}
