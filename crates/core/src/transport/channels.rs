use std::collections::HashMap;

use crate::packet::PacketKind;

/// Routing table from interleaved channel id to the stream that owns it.
///
/// Each channel belongs to exactly one owner at a time; a pair is assigned
/// as `(media, control)`. The server keys owners by session ID, the client
/// by stream index.
#[derive(Debug, Clone)]
pub struct ChannelMap<K> {
    routes: HashMap<u8, (K, PacketKind)>,
}

impl<K> Default for ChannelMap<K> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<K: Clone + PartialEq> ChannelMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `(media, control)` to `owner`.
    ///
    /// Fails with the first conflicting channel if another owner holds
    /// either channel. Re-assigning an owner's own channels is allowed.
    pub fn assign(&mut self, (media, control): (u8, u8), owner: K) -> Result<(), u8> {
        for channel in [media, control] {
            if let Some((current, _)) = self.routes.get(&channel)
                && *current != owner
            {
                return Err(channel);
            }
        }
        self.routes.insert(media, (owner.clone(), PacketKind::Media));
        self.routes.insert(control, (owner, PacketKind::Control));
        Ok(())
    }

    pub fn lookup(&self, channel: u8) -> Option<(&K, PacketKind)> {
        self.routes.get(&channel).map(|(owner, kind)| (owner, *kind))
    }

    pub fn is_free(&self, (media, control): (u8, u8)) -> bool {
        !self.routes.contains_key(&media) && !self.routes.contains_key(&control)
    }

    /// Lowest free even/odd pair.
    pub fn next_free_pair(&self) -> Option<(u8, u8)> {
        (0..=254u8)
            .step_by(2)
            .map(|media| (media, media + 1))
            .find(|&pair| self.is_free(pair))
    }

    /// `(media, control)` channels currently owned by `owner`.
    pub fn channels_of(&self, owner: &K) -> Option<(u8, u8)> {
        let find = |kind: PacketKind| {
            self.routes
                .iter()
                .find(|(_, (o, k))| o == owner && *k == kind)
                .map(|(channel, _)| *channel)
        };
        Some((find(PacketKind::Media)?, find(PacketKind::Control)?))
    }

    /// Drop every channel owned by `owner`, returning how many were freed.
    pub fn release(&mut self, owner: &K) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, (o, _)| o != owner);
        before - self.routes.len()
    }

    /// Every channel currently assigned.
    pub fn assigned(&self) -> impl Iterator<Item = u8> + '_ {
        self.routes.keys().copied()
    }

    /// Drop every channel whose owner fails `keep`, returning how many were freed.
    pub fn retain_owners(&mut self, mut keep: impl FnMut(&K) -> bool) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, (owner, _)| keep(owner));
        before - self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
