//! Role bindings of the single pairing session a relay instance serves.
//!
//! One relay instance carries exactly one viewer/source pair. Serving several
//! pairs means keying this structure by a session identifier.

use std::time::Instant;

use serde::Serialize;

use crate::model::channel::ChannelId;
use crate::model::message::Role;

/// Coarse state of the session, derived from which roles are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Empty,
    ViewerOnly,
    SourceOnly,
    Paired,
}

/// Outcome of binding a channel to a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Binding {
    /// Channel that previously held the role and lost it.
    pub evicted: Option<ChannelId>,
    /// Role the channel held before and had to give up.
    pub released: Option<Role>,
    /// The role slot was empty before this binding.
    pub filled: bool,
}

#[derive(Debug, Default)]
pub struct Session {
    viewer: Option<ChannelId>,
    source: Option<ChannelId>,
    reset_deadline: Option<Instant>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound(&self, role: Role) -> Option<ChannelId> {
        match role {
            Role::Viewer => self.viewer,
            Role::Source => self.source,
        }
    }

    fn slot(&mut self, role: Role) -> &mut Option<ChannelId> {
        match role {
            Role::Viewer => &mut self.viewer,
            Role::Source => &mut self.source,
        }
    }

    /// Role currently held by `id`, if any.
    pub fn role_of(&self, id: ChannelId) -> Option<Role> {
        if self.viewer == Some(id) {
            Some(Role::Viewer)
        } else if self.source == Some(id) {
            Some(Role::Source)
        } else {
            None
        }
    }

    /// Bind `id` to `role`, last writer wins.
    ///
    /// A channel holds at most one role, so binding it to one role releases
    /// the other if it held it.
    pub fn bind(&mut self, role: Role, id: ChannelId) -> Binding {
        let released = match self.role_of(id) {
            Some(held) if held != role => {
                *self.slot(held) = None;
                Some(held)
            }
            _ => None,
        };

        let previous = self.slot(role).replace(id);

        Binding {
            evicted: previous.filter(|prev| *prev != id),
            released,
            filled: previous.is_none(),
        }
    }

    /// Drop whatever role `id` holds.
    pub fn release(&mut self, id: ChannelId) -> Option<Role> {
        let role = self.role_of(id)?;
        *self.slot(role) = None;
        Some(role)
    }

    /// Clear both role bindings. The reset deadline is left alone.
    pub fn clear(&mut self) {
        self.viewer = None;
        self.source = None;
    }

    pub fn state(&self) -> SessionState {
        match (self.viewer.is_some(), self.source.is_some()) {
            (false, false) => SessionState::Empty,
            (true, false) => SessionState::ViewerOnly,
            (false, true) => SessionState::SourceOnly,
            (true, true) => SessionState::Paired,
        }
    }

    pub fn reset_deadline(&self) -> Option<Instant> {
        self.reset_deadline
    }

    /// Arm the reset deadline, replacing any pending one.
    pub fn arm_reset(&mut self, deadline: Instant) -> Option<Instant> {
        self.reset_deadline.replace(deadline)
    }

    pub fn cancel_reset(&mut self) -> Option<Instant> {
        self.reset_deadline.take()
    }

    /// Take the deadline if it has passed at `now`.
    pub fn take_expired_reset(&mut self, now: Instant) -> Option<Instant> {
        match self.reset_deadline {
            Some(deadline) if deadline <= now => self.reset_deadline.take(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(n: u64) -> ChannelId {
        ChannelId::from_raw(n)
    }

    #[test]
    fn last_writer_wins_per_role() {
        let mut session = Session::new();

        assert_eq!(
            session.bind(Role::Viewer, id(1)),
            Binding {
                filled: true,
                ..Binding::default()
            }
        );
        let binding = session.bind(Role::Viewer, id(2));
        assert_eq!(binding.evicted, Some(id(1)));
        assert!(!binding.filled);
        assert_eq!(session.bound(Role::Viewer), Some(id(2)));
        assert_eq!(session.role_of(id(1)), None);
    }

    #[test]
    fn rebinding_same_channel_evicts_nobody_and_fills_nothing() {
        let mut session = Session::new();
        session.bind(Role::Source, id(4));
        assert_eq!(session.bind(Role::Source, id(4)), Binding::default());
    }

    #[test]
    fn filling_the_slot_a_departed_channel_left() {
        let mut session = Session::new();
        session.bind(Role::Viewer, id(1));
        session.bind(Role::Source, id(2));
        session.release(id(1));

        assert!(!session.bind(Role::Source, id(2)).filled);
        assert!(session.bind(Role::Viewer, id(3)).filled);
    }

    #[test]
    fn channel_holds_at_most_one_role() {
        let mut session = Session::new();
        session.bind(Role::Viewer, id(1));

        let binding = session.bind(Role::Source, id(1));
        assert_eq!(binding.released, Some(Role::Viewer));
        assert_eq!(session.bound(Role::Viewer), None);
        assert_eq!(session.bound(Role::Source), Some(id(1)));
        assert_eq!(session.state(), SessionState::SourceOnly);
    }

    #[test]
    fn arbitrary_registration_sequences_keep_one_channel_per_role() {
        let mut session = Session::new();
        let roles = [Role::Viewer, Role::Source];
        for step in 0u64..64 {
            let role = roles[(step * 7 % 3 % 2) as usize];
            session.bind(role, id(step % 5));

            let viewer = session.bound(Role::Viewer);
            let source = session.bound(Role::Source);
            assert!(viewer.is_none() || viewer != source);
            if let Some(v) = viewer {
                assert_eq!(session.role_of(v), Some(Role::Viewer));
            }
            if let Some(s) = source {
                assert_eq!(session.role_of(s), Some(Role::Source));
            }
        }
    }

    #[test]
    fn state_follows_bindings() {
        let mut session = Session::new();
        assert_eq!(session.state(), SessionState::Empty);
        session.bind(Role::Viewer, id(1));
        assert_eq!(session.state(), SessionState::ViewerOnly);
        session.bind(Role::Source, id(2));
        assert_eq!(session.state(), SessionState::Paired);
        assert_eq!(session.release(id(1)), Some(Role::Viewer));
        assert_eq!(session.state(), SessionState::SourceOnly);
        assert_eq!(session.release(id(1)), None);
        session.clear();
        assert_eq!(session.state(), SessionState::Empty);
    }

    #[test]
    fn reset_deadline_is_replaced_not_stacked() {
        let mut session = Session::new();
        let start = Instant::now();
        let first = start + Duration::from_secs(3);
        let second = start + Duration::from_secs(4);

        assert_eq!(session.arm_reset(first), None);
        assert_eq!(session.arm_reset(second), Some(first));
        assert_eq!(session.take_expired_reset(first), None);
        assert_eq!(session.take_expired_reset(second), Some(second));
        assert_eq!(session.take_expired_reset(second), None);
    }
}
