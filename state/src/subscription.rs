//! Subscription fan-out (C9): tracks who wants to be told about new
//! chain tip events versus who wants to be told about activity on a
//! specific address, grounded in the original source's
//! `chain_subscription::ChainSubscriptionState` and
//! `address_subscription::AddressSubscriptionState`.
//!
//! The subscriber identity is left generic (`S`) rather than a
//! reference-counted session pointer: this crate doesn't own the RPC
//! transport, so callers plug in whatever handle (a `SubscriberId`, a
//! channel sender, ...) identifies one listener.

use coinject_core::{Address, Height};
use std::collections::HashMap;

/// Chain-tip subscriptions: every new best block goes to everyone on
/// this list. Dedups by subscriber identity.
#[derive(Default)]
pub struct ChainSubscriptionState<S: Clone + PartialEq> {
    subscriptions: Vec<S>,
}

impl<S: Clone + PartialEq> ChainSubscriptionState<S> {
    pub fn new() -> Self {
        ChainSubscriptionState { subscriptions: Vec::new() }
    }

    pub fn size(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscriptions(&self) -> &[S] {
        &self.subscriptions
    }

    pub fn insert(&mut self, subscriber: S) -> bool {
        if self.subscriptions.contains(&subscriber) {
            return false;
        }
        self.subscriptions.push(subscriber);
        true
    }

    pub fn erase(&mut self, subscriber: &S) {
        self.subscriptions.retain(|s| s != subscriber);
    }
}

/// One cached block entry handed to an address-scoped session; mirrors
/// `SessionAddressCursor` without the live `api::Block` reference (the
/// caller owns block contents and pushes into whatever history buffer
/// it keeps per subscriber).
#[derive(Clone, Debug)]
pub struct AddressActivity {
    pub height: Height,
    pub reward_to_this_address: bool,
    pub transfer_count: usize,
}

/// Per-(subscriber, session) history buffer: caps replay at 100 blocks
/// before forcing the subscriber to reload from scratch, same as the
/// original's hardcoded cutoff.
#[derive(Default)]
struct SessionData {
    force_reload: bool,
    seen: u16,
    blocks: Vec<AddressActivity>,
}

const SESSION_BLOCK_CAP: u16 = 100;

impl SessionData {
    fn session_cursor(&mut self, height: Height) -> Option<&mut AddressActivity> {
        if self.force_reload {
            return None;
        }
        self.seen += 1;
        if self.seen > SESSION_BLOCK_CAP {
            self.blocks.clear();
            self.force_reload = true;
            return None;
        }
        if self.blocks.last().map(|b| b.height < height).unwrap_or(true) {
            self.blocks.push(AddressActivity { height, reward_to_this_address: false, transfer_count: 0 });
        }
        self.blocks.last_mut()
    }
}

type SubId = u64;

struct AddressEntry {
    id: SubId,
    counter: usize,
    latest_tx_height: Option<Height>,
    session_id: u64,
}

/// Address-scoped subscriptions: one address can have multiple
/// subscribers, and a reorg below an address's last-touched height
/// forces that address's session history to reload.
pub struct AddressSubscriptionState<S: Clone + PartialEq> {
    id_counter: SubId,
    session_id: u64,
    map: HashMap<Address, AddressEntry>,
    session_map: HashMap<Address, SessionData>,
    subscriptions: Vec<(SubId, S, Address)>,
}

impl<S: Clone + PartialEq> Default for AddressSubscriptionState<S> {
    fn default() -> Self {
        AddressSubscriptionState { id_counter: 0, session_id: 1, map: HashMap::new(), session_map: HashMap::new(), subscriptions: Vec::new() }
    }
}

impl<S: Clone + PartialEq> AddressSubscriptionState<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subscriber: S, address: Address) -> bool {
        let new_address = !self.map.contains_key(&address);
        let id = if new_address {
            self.id_counter += 1;
            let id = self.id_counter;
            self.map.insert(address, AddressEntry { id, counter: 0, latest_tx_height: None, session_id: 0 });
            id
        } else {
            self.map[&address].id
        };

        if !new_address {
            let already = self.subscriptions.iter().any(|(id2, s2, _)| *id2 == id && s2 == &subscriber);
            if already {
                return false;
            }
        }
        self.map.get_mut(&address).unwrap().counter += 1;
        self.subscriptions.push((id, subscriber, address));
        true
    }

    fn drop_one(&mut self, address: &Address) {
        if let Some(entry) = self.map.get_mut(address) {
            entry.counter -= 1;
            if entry.counter == 0 {
                self.map.remove(address);
            }
        }
    }

    /// Removes every subscription belonging to `subscriber`, across all
    /// addresses. Returns how many were removed.
    pub fn erase_all(&mut self, subscriber: &S) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.subscriptions.len() {
            if &self.subscriptions[i].1 == subscriber {
                let (_, _, addr) = self.subscriptions.remove(i);
                self.drop_one(&addr);
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Removes `subscriber`'s subscription to a single `address`.
    pub fn erase(&mut self, subscriber: &S, address: &Address) -> usize {
        let Some(id) = self.map.get(address).map(|e| e.id) else { return 0 };
        let mut removed = 0;
        let mut i = 0;
        while i < self.subscriptions.len() {
            let (id2, s2, a2) = &self.subscriptions[i];
            if *id2 == id && s2 == subscriber && a2 == address {
                self.subscriptions.remove(i);
                self.drop_one(address);
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    pub fn session_start(&mut self) {
        self.session_id += 1;
        self.session_map.clear();
    }

    /// Marks every address whose last recorded activity sits above the
    /// new chain tip `h` as needing a full history reload.
    pub fn session_rollback(&mut self, h: Height) {
        let session_id = self.session_id;
        let dirty: Vec<Address> = self.map.iter().filter(|(_, e)| e.latest_tx_height.map(|lh| h < lh).unwrap_or(false)).map(|(a, _)| *a).collect();
        for addr in dirty {
            let entry = self.map.get_mut(&addr).unwrap();
            if entry.session_id != session_id {
                entry.session_id = session_id;
            }
            self.session_map.entry(addr).or_default().force_reload = true;
        }
    }

    fn session_cursor(&mut self, address: &Address, height: Height) -> Option<&mut AddressActivity> {
        let entry = self.map.get_mut(address)?;
        entry.latest_tx_height = Some(height);
        self.session_map.entry(*address).or_default().session_cursor(height)
    }

    /// Feeds one confirmed block's activity into every touched
    /// address's session buffer: the reward recipient (if any) and
    /// both sides of every transfer.
    pub fn session_block(&mut self, height: Height, reward_to: Option<Address>, transfer_parties: &[(Address, Address)]) {
        if let Some(addr) = reward_to {
            if let Some(cursor) = self.session_cursor(&addr, height) {
                cursor.reward_to_this_address = true;
            }
        }
        for (from, to) in transfer_parties {
            if let Some(cursor) = self.session_cursor(to, height) {
                cursor.transfer_count += 1;
            }
            if let Some(cursor) = self.session_cursor(from, height) {
                cursor.transfer_count += 1;
            }
        }
    }

    /// All subscribers registered for `address`.
    pub fn subscribers_for(&self, address: &Address) -> Vec<S> {
        let Some(id) = self.map.get(address).map(|e| e.id) else { return Vec::new() };
        self.subscriptions.iter().filter(|(id2, _, _)| *id2 == id).map(|(_, s, _)| s.clone()).collect()
    }

    pub fn tracked_address_count(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 20])
    }

    #[test]
    fn chain_subscription_dedups_by_identity() {
        let mut state: ChainSubscriptionState<u32> = ChainSubscriptionState::new();
        assert!(state.insert(1));
        assert!(!state.insert(1));
        assert_eq!(state.size(), 1);
    }

    #[test]
    fn address_subscription_tracks_multiple_subscribers_per_address() {
        let mut state: AddressSubscriptionState<u32> = AddressSubscriptionState::new();
        assert!(state.insert(1, addr(1)));
        assert!(state.insert(2, addr(1)));
        assert!(!state.insert(1, addr(1)));
        assert_eq!(state.subscribers_for(&addr(1)).len(), 2);
    }

    #[test]
    fn erase_all_drops_subscriber_from_every_address_and_frees_empty_entries() {
        let mut state: AddressSubscriptionState<u32> = AddressSubscriptionState::new();
        state.insert(1, addr(1));
        state.insert(1, addr(2));
        assert_eq!(state.erase_all(&1), 2);
        assert_eq!(state.tracked_address_count(), 0);
    }

    #[test]
    fn rollback_below_an_addresss_last_activity_forces_reload() {
        let mut state: AddressSubscriptionState<u32> = AddressSubscriptionState::new();
        state.insert(1, addr(1));
        state.session_start();
        state.session_block(Height::new(10), Some(addr(1)), &[]);
        state.session_rollback(Height::new(5));
        assert!(state.session_map.get(&addr(1)).unwrap().force_reload);
    }

    #[test]
    fn session_cursor_caps_history_and_forces_reload_past_the_limit() {
        let mut state: AddressSubscriptionState<u32> = AddressSubscriptionState::new();
        state.insert(1, addr(1));
        state.session_start();
        for h in 0..=SESSION_BLOCK_CAP {
            state.session_block(Height::new(h as u32), Some(addr(1)), &[]);
        }
        assert!(state.session_map.get(&addr(1)).unwrap().force_reload);
    }
}
