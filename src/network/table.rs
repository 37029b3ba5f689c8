// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use parking_lot::Mutex;

use crate::service::{AppError, AppResult, ErrorKind};

/// Index of a connection in a server's connection table.
pub type ClientId = usize;

#[derive(Debug)]
enum Slot<T> {
    Vacant,
    Live(T),
    /// Released, but events for the old connection may still be dispatching.
    Retiring,
}

/// Fixed-capacity registry of live connections.
///
/// A released id stays unavailable until [`ConnectionTable::vacate`] is
/// called for it, so an id is never handed to a new connection while events
/// of the previous one are in flight. Free ids are handed out lowest first.
#[derive(Debug)]
pub struct ConnectionTable<T> {
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T: Clone> ConnectionTable<T> {
    pub fn new(max_clients: usize) -> Self {
        ConnectionTable {
            slots: Mutex::new((0..max_clients).map(|_| Slot::Vacant).collect()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn allocate(&self, entry: T) -> AppResult<ClientId> {
        let mut slots = self.slots.lock();
        let client_id = slots
            .iter()
            .position(|slot| matches!(slot, Slot::Vacant))
            .ok_or(AppError::new(ErrorKind::TableFull))?;
        slots[client_id] = Slot::Live(entry);
        Ok(client_id)
    }

    pub fn get(&self, client_id: ClientId) -> AppResult<T> {
        match self.slots.lock().get(client_id) {
            Some(Slot::Live(entry)) => Ok(entry.clone()),
            _ => Err(AppError::new(ErrorKind::ClientDoesNotExist)),
        }
    }

    /// Takes the entry out of a live slot. Releasing a slot that is not live
    /// fails with `ClientDoesNotExist`.
    pub fn release(&self, client_id: ClientId) -> AppResult<T> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(client_id)
            .ok_or(AppError::new(ErrorKind::ClientDoesNotExist))?;
        match std::mem::replace(slot, Slot::Retiring) {
            Slot::Live(entry) => Ok(entry),
            other => {
                *slot = other;
                Err(AppError::new(ErrorKind::ClientDoesNotExist))
            }
        }
    }

    pub fn release_all(&self) -> Vec<(ClientId, T)> {
        let mut slots = self.slots.lock();
        slots
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .filter_map(|(client_id, slot)| match std::mem::replace(slot, Slot::Retiring) {
                Slot::Live(entry) => Some((client_id, entry)),
                _ => None,
            })
            .collect()
    }

    /// Makes a released id available again.
    pub fn vacate(&self, client_id: ClientId) {
        if let Some(slot) = self.slots.lock().get_mut(client_id) {
            if matches!(slot, Slot::Retiring) {
                *slot = Slot::Vacant;
            }
        }
    }

    pub fn count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// Visits every live entry in id order. The visitor sees a snapshot and
    /// may call back into the table.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(ClientId, &T),
    {
        let live: Vec<(ClientId, T)> = self
            .slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(client_id, slot)| match slot {
                Slot::Live(entry) => Some((client_id, entry.clone())),
                _ => None,
            })
            .collect();
        for (client_id, entry) in &live {
            visitor(*client_id, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(16)]
    fn release_before_any_client_fails(#[case] max_clients: usize) {
        let table: ConnectionTable<&str> = ConnectionTable::new(max_clients);
        let err = table.release(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientDoesNotExist);
        assert_eq!(
            table.get(0).unwrap_err().kind(),
            ErrorKind::ClientDoesNotExist
        );
    }

    #[test]
    fn allocates_lowest_free_slot() {
        let table = ConnectionTable::new(3);
        assert_eq!(table.allocate("a").unwrap(), 0);
        assert_eq!(table.allocate("b").unwrap(), 1);
        assert_eq!(table.allocate("c").unwrap(), 2);
        assert_eq!(
            table.allocate("d").unwrap_err().kind(),
            ErrorKind::TableFull
        );

        assert_eq!(table.release(1).unwrap(), "b");
        assert_eq!(table.count(), 2);
        // still retiring
        assert_eq!(
            table.allocate("d").unwrap_err().kind(),
            ErrorKind::TableFull
        );

        table.vacate(1);
        assert_eq!(table.allocate("d").unwrap(), 1);
        assert_eq!(table.get(1).unwrap(), "d");
    }

    #[test]
    fn release_twice_fails() {
        let table = ConnectionTable::new(2);
        let id = table.allocate(7).unwrap();
        assert_eq!(table.release(id).unwrap(), 7);
        assert_eq!(
            table.release(id).unwrap_err().kind(),
            ErrorKind::ClientDoesNotExist
        );
        table.vacate(id);
        assert_eq!(
            table.release(id).unwrap_err().kind(),
            ErrorKind::ClientDoesNotExist
        );
    }

    #[test]
    fn vacate_leaves_live_slots_alone() {
        let table = ConnectionTable::new(1);
        let id = table.allocate(1).unwrap();
        table.vacate(id);
        assert_eq!(table.get(id).unwrap(), 1);
    }

    #[test]
    fn release_all_and_for_each() {
        let table = ConnectionTable::new(4);
        for value in [10, 20, 30] {
            table.allocate(value).unwrap();
        }
        table.release(1).unwrap();

        let mut seen = Vec::new();
        table.for_each(|id, value| seen.push((id, *value)));
        assert_eq!(seen, vec![(0, 10), (2, 30)]);

        assert_eq!(table.release_all(), vec![(0, 10), (2, 30)]);
        assert_eq!(table.count(), 0);
        assert_eq!(table.capacity(), 4);
    }
}
