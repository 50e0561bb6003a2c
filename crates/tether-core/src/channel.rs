//! Replicated state channels.
//!
//! A channel is a last-value-wins slot, not a stream. The owner bumps an
//! 8-bit sequence on every update and sends `[sequence][value]` unreliably
//! to each attached connection. Peers acknowledge with `Sync`; the manager's
//! tick resends the last value to connections that have not acknowledged it
//! once the resend delay has passed.
//!
//! ```text
//!  owner                                   peer
//!    │ ── Update(ch, seq=4, value) ──────>   │  4 > last: deliver, ack
//!    │ <────────────────── Sync(ch, 4) ──   │
//!    │ ── Update(ch, seq=4, value) ──────>   │  4 == last: ack only
//!    │ ── Update(ch, seq=3, stale) ──────>   │  3 < last: drop
//! ```
//!
//! Sequences compare with a plain `>`, so after 255 updates the counter
//! wraps to 0 and peers drop updates until it climbs past their last value
//! again.

use crate::codec::Message;
use crate::connection::ConnectionRef;
use crate::error::{NetworkError, Result};
use crate::id::Tracker;
use crate::manager::ManagerId;
use crate::manager::command::{ChannelCommand, Command, Mailbox};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// One send of a channel value.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<M> {
    /// Sequence carried by the frame
    pub sequence: u8,
    /// Channel value
    pub message: M,
    /// Remote connections to send to
    pub remote: Vec<u32>,
    /// Local connections to call directly
    pub local: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Member {
    local: bool,
    synced: bool,
}

/// Owner-side state of one channel. Time is passed in.
#[derive(Debug)]
pub struct ChannelState<M> {
    profile: Option<M>,
    sequence: u8,
    last: Option<M>,
    last_sent: Option<Instant>,
    members: HashMap<u32, Member>,
    resend_delay: Duration,
    skip_unchanged: bool,
}

impl<M: Message> ChannelState<M> {
    /// Create an empty channel.
    pub fn new(profile: Option<M>, resend_delay: Duration, skip_unchanged: bool) -> Self {
        Self {
            profile,
            sequence: 0,
            last: None,
            last_sent: None,
            members: HashMap::new(),
            resend_delay,
            skip_unchanged,
        }
    }

    /// Profile announced in `OpenChannel`.
    pub fn profile(&self) -> Option<&M> {
        self.profile.as_ref()
    }

    /// Current sequence.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Last value sent.
    pub fn last(&self) -> Option<&M> {
        self.last.as_ref()
    }

    /// Attach a connection. If a value exists it is delivered right away.
    /// Returns `None` if already attached or there is nothing to send.
    pub fn attach(&mut self, connection: u32, local: bool) -> Option<Delivery<M>> {
        if self.members.contains_key(&connection) {
            return None;
        }
        let has_value = self.last.is_some();
        self.members.insert(
            connection,
            Member {
                local,
                synced: local || !has_value,
            },
        );
        let message = self.last.clone()?;
        let (remote, local_ids) = if local {
            (Vec::new(), vec![connection])
        } else {
            (vec![connection], Vec::new())
        };
        Some(Delivery {
            sequence: self.sequence,
            message,
            remote,
            local: local_ids,
        })
    }

    /// Detach a connection. Returns true if it was attached.
    pub fn detach(&mut self, connection: u32) -> bool {
        self.members.remove(&connection).is_some()
    }

    /// Returns true if `connection` is attached.
    pub fn contains(&self, connection: u32) -> bool {
        self.members.contains_key(&connection)
    }

    /// Attached connection IDs with their locality.
    pub fn members(&self) -> impl Iterator<Item = (u32, bool)> + '_ {
        self.members.iter().map(|(id, member)| (*id, member.local))
    }

    /// Publish a new value. Returns `None` when skipped as unchanged.
    pub fn update(&mut self, message: M, now: Instant) -> Option<Delivery<M>> {
        if self.skip_unchanged && self.last.as_ref() == Some(&message) {
            return None;
        }
        self.sequence = self.sequence.wrapping_add(1);
        self.last = Some(message.clone());
        self.last_sent = Some(now);

        let mut remote = Vec::new();
        let mut local = Vec::new();
        for (id, member) in &mut self.members {
            member.synced = member.local;
            if member.local {
                local.push(*id);
            } else {
                remote.push(*id);
            }
        }
        Some(Delivery {
            sequence: self.sequence,
            message,
            remote,
            local,
        })
    }

    /// Record an acknowledgement. Returns true if it matched the current
    /// sequence for an attached connection.
    pub fn on_sync(&mut self, connection: u32, sequence: u8) -> bool {
        if sequence != self.sequence {
            return false;
        }
        match self.members.get_mut(&connection) {
            Some(member) => {
                member.synced = true;
                true
            }
            None => false,
        }
    }

    /// Remote connections still waiting for the current value.
    pub fn pending(&self) -> Vec<u32> {
        let mut pending: Vec<u32> = self
            .members
            .iter()
            .filter(|(_, member)| !member.synced)
            .map(|(id, _)| *id)
            .collect();
        pending.sort_unstable();
        pending
    }

    /// Returns true once every attached connection acknowledged the current value.
    pub fn is_synced(&self) -> bool {
        self.members.values().all(|member| member.synced)
    }

    /// Resend the last value to unacknowledged connections if the resend
    /// delay has passed since the last send.
    pub fn try_resend(&mut self, now: Instant) -> Option<Delivery<M>> {
        let last_sent = self.last_sent?;
        if now.saturating_duration_since(last_sent) < self.resend_delay {
            return None;
        }
        let remote = self.pending();
        if remote.is_empty() {
            return None;
        }
        let message = self.last.clone()?;
        self.last_sent = Some(now);
        Some(Delivery {
            sequence: self.sequence,
            message,
            remote,
            local: Vec::new(),
        })
    }
}

/// Peer-side record of a channel opened to us.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceivedChannel {
    last: u8,
}

impl ReceivedChannel {
    /// Fresh record; the first update carries sequence 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last accepted sequence.
    pub fn last(&self) -> u8 {
        self.last
    }

    /// Returns true if `sequence` should be acknowledged (not older than the
    /// last accepted one).
    pub fn should_ack(&self, sequence: u8) -> bool {
        sequence >= self.last
    }

    /// Accept `sequence` if strictly greater than the last accepted one.
    pub fn accept(&mut self, sequence: u8) -> bool {
        if sequence > self.last {
            self.last = sequence;
            true
        } else {
            false
        }
    }
}

/// Registry of channels owned by one manager.
#[derive(Debug)]
pub struct ChannelProvider<M> {
    channels: Tracker<ChannelState<M>>,
    unsynced: BTreeSet<u32>,
    resend_delay: Duration,
    skip_unchanged: bool,
}

impl<M: Message> ChannelProvider<M> {
    /// Create an empty provider.
    pub fn new(resend_delay: Duration, reuse_delay: Duration, skip_unchanged: bool) -> Self {
        Self {
            channels: Tracker::new(1, reuse_delay),
            unsynced: BTreeSet::new(),
            resend_delay,
            skip_unchanged,
        }
    }

    /// Create a channel, returning its ID.
    pub fn create(&mut self, profile: Option<M>) -> i32 {
        let state = ChannelState::new(profile, self.resend_delay, self.skip_unchanged);
        // IDs stay far below i32::MAX under the reuse policy
        self.channels.insert(state) as i32
    }

    /// Look up a channel.
    pub fn get(&self, channel: i32) -> Option<&ChannelState<M>> {
        self.channels.get(channel as u32)
    }

    fn state_mut(&mut self, channel: i32) -> Result<&mut ChannelState<M>> {
        self.channels
            .get_mut(channel as u32)
            .ok_or(NetworkError::invalid_state("unknown channel"))
    }

    fn mark(&mut self, channel: i32) {
        let synced = self
            .channels
            .get(channel as u32)
            .is_none_or(ChannelState::is_synced);
        if synced {
            self.unsynced.remove(&(channel as u32));
        } else {
            self.unsynced.insert(channel as u32);
        }
    }

    /// Attach a connection to a channel.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidState`] for an unknown channel.
    pub fn attach(&mut self, channel: i32, connection: u32, local: bool) -> Result<Option<Delivery<M>>> {
        let delivery = self.state_mut(channel)?.attach(connection, local);
        self.mark(channel);
        Ok(delivery)
    }

    /// Detach a connection from a channel. Returns true if it was attached.
    pub fn detach(&mut self, channel: i32, connection: u32) -> bool {
        let detached = self
            .channels
            .get_mut(channel as u32)
            .is_some_and(|state| state.detach(connection));
        self.mark(channel);
        detached
    }

    /// Detach a connection from every channel, returning the channels it left.
    pub fn detach_all(&mut self, connection: u32) -> Vec<i32> {
        let left: Vec<i32> = self
            .channels
            .iter_mut()
            .filter_map(|(id, state)| state.detach(connection).then_some(id as i32))
            .collect();
        for channel in &left {
            self.mark(*channel);
        }
        left
    }

    /// Publish a value.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidState`] for an unknown channel.
    pub fn update(&mut self, channel: i32, message: M, now: Instant) -> Result<Option<Delivery<M>>> {
        let delivery = self.state_mut(channel)?.update(message, now);
        self.mark(channel);
        Ok(delivery)
    }

    /// Record an acknowledgement from `connection`.
    pub fn on_sync(&mut self, channel: i32, connection: u32, sequence: u8) -> bool {
        let matched = self
            .channels
            .get_mut(channel as u32)
            .is_some_and(|state| state.on_sync(connection, sequence));
        if matched {
            self.mark(channel);
        }
        matched
    }

    /// Run resends for unsynced channels only.
    pub fn tick(&mut self, now: Instant) -> Vec<(i32, Delivery<M>)> {
        let mut resends = Vec::new();
        let unsynced: Vec<u32> = self.unsynced.iter().copied().collect();
        for id in unsynced {
            match self.channels.get_mut(id) {
                Some(state) => {
                    if let Some(delivery) = state.try_resend(now) {
                        resends.push((id as i32, delivery));
                    }
                }
                None => {
                    self.unsynced.remove(&id);
                }
            }
        }
        resends
    }

    /// Remove a channel, releasing its ID.
    pub fn close(&mut self, channel: i32) -> Option<ChannelState<M>> {
        self.unsynced.remove(&(channel as u32));
        self.channels.remove(channel as u32)
    }

    /// Number of channels awaiting acknowledgements.
    pub fn unsynced(&self) -> usize {
        self.unsynced.len()
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if no channels are open.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Handle to a channel owned by a manager.
///
/// Every operation is forwarded to the manager's actor. Dropping the handle
/// closes the channel for everyone, like [`close`](Self::close).
pub struct Channel<M: Message> {
    id: i32,
    manager: ManagerId,
    mailbox: Mailbox<M>,
    closed: bool,
}

impl<M: Message> Channel<M> {
    pub(crate) fn new(id: i32, manager: ManagerId, mailbox: Mailbox<M>) -> Self {
        Self {
            id,
            manager,
            mailbox,
            closed: false,
        }
    }

    /// Channel ID.
    pub fn id(&self) -> i32 {
        self.id
    }

    fn post(&self, command: ChannelCommand<M>) -> Result<()> {
        self.mailbox
            .send(Command::Channel(command))
            .map_err(|_| NetworkError::Closed)
    }

    /// Connection IDs are only meaningful to the manager that assigned them.
    fn member_id(&self, connection: &ConnectionRef<M>) -> Result<u32> {
        if connection.manager() != Some(self.manager) {
            return Err(NetworkError::invalid_state(
                "connection belongs to another manager",
            ));
        }
        Ok(connection.id())
    }

    /// Open the channel to `connection`, sending the current value if any.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidState`] if `connection` is not owned by
    /// this channel's manager, or [`NetworkError::Closed`] if the manager has
    /// shut down.
    pub fn open(&self, connection: &ConnectionRef<M>) -> Result<()> {
        let connection = self.member_id(connection)?;
        self.post(ChannelCommand::Attach {
            channel: self.id,
            connection,
        })
    }

    /// Publish a new value to every attached connection.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Closed`] if the manager has shut down.
    pub fn update(&self, message: M) -> Result<()> {
        self.post(ChannelCommand::Update {
            channel: self.id,
            message,
        })
    }

    /// Close the channel for one connection.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidState`] if `connection` is not owned by
    /// this channel's manager, or [`NetworkError::Closed`] if the manager has
    /// shut down.
    pub fn close_for(&self, connection: &ConnectionRef<M>) -> Result<()> {
        let connection = self.member_id(connection)?;
        self.post(ChannelCommand::Detach {
            channel: self.id,
            connection,
        })
    }

    /// Close the channel for everyone and release its ID.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Closed`] if the manager has shut down.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.post(ChannelCommand::Close { channel: self.id })
    }
}

impl<M: Message> Drop for Channel<M> {
    fn drop(&mut self) {
        if !self.closed {
            // Fails only once the actor is gone, and the channel with it
            let _ = self.post(ChannelCommand::Close { channel: self.id });
        }
    }
}

impl<M: Message> std::fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}
