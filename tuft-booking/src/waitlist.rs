use chrono::{DateTime, Utc};
use tuft_catalog::{Availability, FrameSize};
use tuft_core::{StudioError, StudioResult};
use uuid::Uuid;

use crate::models::WaitlistEntry;
use crate::policy::FrameMatching;

/// Ordered queue for one class. Entries are kept sorted by priority and the
/// priorities are always exactly 1..=N.
#[derive(Debug, Clone, PartialEq)]
pub struct Waitlist {
    class_id: Uuid,
    entries: Vec<WaitlistEntry>,
}

impl Waitlist {
    pub fn new(class_id: Uuid) -> Self {
        Self { class_id, entries: Vec::new() }
    }

    /// Loads stored rows. Order comes from the stored priority, then join
    /// time; priorities are renumbered so gaps never survive a load.
    pub fn from_entries(class_id: Uuid, mut entries: Vec<WaitlistEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        let mut waitlist = Self { class_id, entries };
        waitlist.rerank();
        waitlist
    }

    pub fn class_id(&self) -> Uuid {
        self.class_id
    }

    pub fn entries(&self) -> &[WaitlistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_for(&self, user_id: Uuid) -> Option<&WaitlistEntry> {
        self.entries.iter().find(|e| e.user_id == user_id)
    }

    /// Appends at N+1, or inserts at `priority` and pushes the rest down.
    pub fn join(
        &mut self,
        user_id: Uuid,
        frame_size: Option<FrameSize>,
        priority: Option<u32>,
        now: DateTime<Utc>,
    ) -> StudioResult<WaitlistEntry> {
        if self.entry_for(user_id).is_some() {
            return Err(StudioError::AlreadyExists {
                entity: "waitlist_entry",
                detail: format!("user {} already waiting for class {}", user_id, self.class_id),
            });
        }

        let tail = self.entries.len() as u32 + 1;
        let position = match priority {
            None => tail,
            Some(p) if (1..=tail).contains(&p) => p,
            Some(p) => {
                return Err(StudioError::ValidationError(format!(
                    "waitlist priority {} outside 1..={}",
                    p, tail
                )))
            }
        };

        let entry = WaitlistEntry {
            id: Uuid::new_v4(),
            user_id,
            class_id: self.class_id,
            frame_size,
            priority: position,
            created_at: now,
        };
        self.entries.insert(position as usize - 1, entry);
        self.rerank();

        Ok(self.entries[position as usize - 1].clone())
    }

    pub fn leave(&mut self, user_id: Uuid) -> StudioResult<WaitlistEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.user_id == user_id)
            .ok_or_else(|| StudioError::not_found("waitlist_entry", user_id))?;
        Ok(self.remove_at(index))
    }

    pub fn remove_entry(&mut self, entry_id: Uuid) -> StudioResult<WaitlistEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == entry_id)
            .ok_or_else(|| StudioError::not_found("waitlist_entry", entry_id))?;
        Ok(self.remove_at(index))
    }

    /// Drops the user's entry if there is one. Used when they get a seat.
    pub fn discard_user(&mut self, user_id: Uuid) -> Option<WaitlistEntry> {
        let index = self.entries.iter().position(|e| e.user_id == user_id)?;
        Some(self.remove_at(index))
    }

    /// First entry, by priority, that fits a free seat. With strict matching a
    /// frame-tagged vacancy only goes to entries asking for the same frame or
    /// for none.
    pub fn next_candidate(
        &self,
        availability: &Availability,
        vacated: Option<FrameSize>,
        matching: FrameMatching,
    ) -> Option<&WaitlistEntry> {
        self.entries.iter().find(|entry| {
            if !availability.has_seat(entry.frame_size) {
                return false;
            }
            match (matching, vacated) {
                (FrameMatching::StrictWhenTyped, Some(frame)) => {
                    entry.frame_size.map_or(true, |wanted| wanted == frame)
                }
                _ => true,
            }
        })
    }

    /// Moves an entry to `new_priority`; entries between the old and new
    /// slot shift by one toward the gap.
    pub fn reorder(&mut self, entry_id: Uuid, new_priority: u32) -> StudioResult<()> {
        let len = self.entries.len() as u32;
        if new_priority == 0 || new_priority > len {
            return Err(StudioError::ValidationError(format!(
                "waitlist priority {} outside 1..={}",
                new_priority, len
            )));
        }
        let index = self
            .entries
            .iter()
            .position(|e| e.id == entry_id)
            .ok_or_else(|| StudioError::not_found("waitlist_entry", entry_id))?;

        let entry = self.entries.remove(index);
        self.entries.insert(new_priority as usize - 1, entry);
        self.rerank();
        Ok(())
    }

    pub fn clear(&mut self) -> Vec<WaitlistEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn is_dense(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.priority == i as u32 + 1)
    }

    fn remove_at(&mut self, index: usize) -> WaitlistEntry {
        let entry = self.entries.remove(index);
        self.rerank();
        entry
    }

    fn rerank(&mut self) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.priority = i as u32 + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tuft_catalog::{Class, NewClass};

    fn users(waitlist: &Waitlist) -> Vec<Uuid> {
        waitlist.entries().iter().map(|e| e.user_id).collect()
    }

    fn framed_class() -> Class {
        let starts_at = Utc::now() + Duration::days(3);
        Class::new(
            NewClass {
                class_type_id: Uuid::new_v4(),
                title: "Punch Needle".to_string(),
                location: "Studio B".to_string(),
                instructor_id: None,
                starts_at,
                ends_at: starts_at + Duration::hours(2),
                capacity: 2,
                frame_capacity: BTreeMap::from([(FrameSize::Small, 1), (FrameSize::Large, 1)]),
                price_cents: 6000,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_join_appends_and_rejects_duplicates() {
        let mut waitlist = Waitlist::new(Uuid::new_v4());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(waitlist.join(a, None, None, Utc::now()).unwrap().priority, 1);
        assert_eq!(waitlist.join(b, None, None, Utc::now()).unwrap().priority, 2);
        assert!(matches!(
            waitlist.join(a, None, None, Utc::now()),
            Err(StudioError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_join_at_priority_shifts_others() {
        let mut waitlist = Waitlist::new(Uuid::new_v4());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        waitlist.join(a, None, None, Utc::now()).unwrap();
        waitlist.join(b, None, None, Utc::now()).unwrap();

        let entry = waitlist.join(c, None, Some(1), Utc::now()).unwrap();

        assert_eq!(entry.priority, 1);
        assert_eq!(users(&waitlist), vec![c, a, b]);
        assert!(waitlist.is_dense());
        assert!(waitlist.join(Uuid::new_v4(), None, Some(9), Utc::now()).is_err());
    }

    #[test]
    fn test_leave_closes_gap() {
        let mut waitlist = Waitlist::new(Uuid::new_v4());
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            waitlist.join(*id, None, None, Utc::now()).unwrap();
        }

        waitlist.leave(ids[1]).unwrap();

        assert_eq!(users(&waitlist), vec![ids[0], ids[2], ids[3]]);
        assert_eq!(
            waitlist.entries().iter().map(|e| e.priority).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(matches!(waitlist.leave(ids[1]), Err(StudioError::NotFound { .. })));
    }

    #[test]
    fn test_reorder_moves_both_directions() {
        let mut waitlist = Waitlist::new(Uuid::new_v4());
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            waitlist.join(*id, None, None, Utc::now()).unwrap();
        }
        let last = waitlist.entries()[3].id;

        waitlist.reorder(last, 1).unwrap();
        assert_eq!(users(&waitlist), vec![ids[3], ids[0], ids[1], ids[2]]);

        waitlist.reorder(last, 3).unwrap();
        assert_eq!(users(&waitlist), vec![ids[0], ids[1], ids[3], ids[2]]);
        assert!(waitlist.is_dense());

        assert!(matches!(waitlist.reorder(last, 0), Err(StudioError::ValidationError(_))));
        assert!(matches!(waitlist.reorder(last, 5), Err(StudioError::ValidationError(_))));
    }

    #[test]
    fn test_from_entries_renumbers_gaps() {
        let class_id = Uuid::new_v4();
        let now = Utc::now();
        let entry = |priority: u32| WaitlistEntry {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            class_id,
            frame_size: None,
            priority,
            created_at: now,
        };
        let waitlist = Waitlist::from_entries(class_id, vec![entry(7), entry(2), entry(4)]);
        assert!(waitlist.is_dense());
        assert_eq!(waitlist.len(), 3);
    }

    #[test]
    fn test_strict_matching_prefers_same_frame() {
        let class = framed_class();
        let availability = Availability::calculate(&class, vec![Some(FrameSize::Large)]);
        let mut waitlist = Waitlist::new(class.id);
        let small = Uuid::new_v4();
        let large = Uuid::new_v4();
        waitlist.join(small, Some(FrameSize::Small), None, Utc::now()).unwrap();
        waitlist.join(large, Some(FrameSize::Large), None, Utc::now()).unwrap();

        // Only the SMALL bucket is free.
        let strict = waitlist
            .next_candidate(&availability, Some(FrameSize::Small), FrameMatching::StrictWhenTyped)
            .unwrap();
        assert_eq!(strict.user_id, small);

        let none_free = Availability::calculate(&class, vec![Some(FrameSize::Large), Some(FrameSize::Small)]);
        assert!(waitlist
            .next_candidate(&none_free, None, FrameMatching::Fifo)
            .is_none());
    }

    #[test]
    fn test_strict_matching_skips_other_frames() {
        let class = framed_class();
        let availability = Availability::calculate(&class, Vec::new());
        let mut waitlist = Waitlist::new(class.id);
        let large = Uuid::new_v4();
        let small = Uuid::new_v4();
        waitlist.join(large, Some(FrameSize::Large), None, Utc::now()).unwrap();
        waitlist.join(small, Some(FrameSize::Small), None, Utc::now()).unwrap();

        let strict = waitlist
            .next_candidate(&availability, Some(FrameSize::Small), FrameMatching::StrictWhenTyped)
            .unwrap();
        assert_eq!(strict.user_id, small);

        let fifo = waitlist
            .next_candidate(&availability, Some(FrameSize::Small), FrameMatching::Fifo)
            .unwrap();
        assert_eq!(fifo.user_id, large);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join(Option<u32>),
        Leave(usize),
        Reorder(usize, u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::option::of(1u32..6).prop_map(Op::Join),
            (0usize..8).prop_map(Op::Leave),
            (0usize..8, 1u32..8).prop_map(|(i, p)| Op::Reorder(i, p)),
        ]
    }

    proptest! {
        #[test]
        fn prop_priorities_stay_dense(ops in prop::collection::vec(op(), 0..60)) {
            let mut waitlist = Waitlist::new(Uuid::new_v4());
            for op in ops {
                match op {
                    Op::Join(priority) => {
                        let _ = waitlist.join(Uuid::new_v4(), None, priority, Utc::now());
                    }
                    Op::Leave(i) => {
                        if let Some(user_id) = waitlist.entries().get(i).map(|e| e.user_id) {
                            waitlist.leave(user_id).unwrap();
                        }
                    }
                    Op::Reorder(i, p) => {
                        if let Some(id) = waitlist.entries().get(i).map(|e| e.id) {
                            let _ = waitlist.reorder(id, p);
                        }
                    }
                }
                prop_assert!(waitlist.is_dense());
            }
        }
    }
}
