use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tuft_core::{StudioError, StudioResult};

use crate::class::{Class, FrameSize};

/// Seat count for one frame bucket
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameAvailability {
    pub capacity: u32,
    pub active: u32,
    pub available: u32,
}

/// Remaining seats for a class, overall and per frame bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Availability {
    pub capacity: u32,
    pub active: u32,
    pub available: u32,
    pub frames: BTreeMap<FrameSize, FrameAvailability>,
}

impl Availability {
    /// Counts seats from the frame tags of the class's active reservations
    /// (CONFIRMED or CHECKED_IN). The caller filters by status.
    pub fn calculate<I>(class: &Class, active_frames: I) -> Self
    where
        I: IntoIterator<Item = Option<FrameSize>>,
    {
        let mut active = 0u32;
        let mut per_frame: BTreeMap<FrameSize, u32> = BTreeMap::new();
        for frame in active_frames {
            active += 1;
            if let Some(frame) = frame {
                *per_frame.entry(frame).or_default() += 1;
            }
        }

        let frames = class
            .frame_capacity
            .iter()
            .map(|(frame, capacity)| {
                let taken = per_frame.get(frame).copied().unwrap_or(0);
                (
                    *frame,
                    FrameAvailability {
                        capacity: *capacity,
                        active: taken,
                        available: capacity.saturating_sub(taken),
                    },
                )
            })
            .collect();

        Self {
            capacity: class.capacity,
            active,
            available: class.capacity.saturating_sub(active),
            frames,
        }
    }

    /// A seat is free overall and, when the class tracks frames and a frame
    /// is requested, in that frame's bucket too.
    pub fn has_seat(&self, frame: Option<FrameSize>) -> bool {
        if self.available == 0 {
            return false;
        }
        match (frame, self.frames.is_empty()) {
            (Some(frame), false) => self
                .frames
                .get(&frame)
                .map(|bucket| bucket.available > 0)
                .unwrap_or(false),
            _ => true,
        }
    }

    pub fn ensure_seat(&self, frame: Option<FrameSize>) -> StudioResult<()> {
        if self.available == 0 {
            return Err(StudioError::CapacityExceeded {
                capacity: self.capacity,
                active: self.active,
                frame_size: None,
            });
        }
        if !self.has_seat(frame) {
            let bucket = frame.and_then(|f| self.frames.get(&f).copied());
            return Err(StudioError::CapacityExceeded {
                capacity: bucket.map(|b| b.capacity).unwrap_or(0),
                active: bucket.map(|b| b.active).unwrap_or(0),
                frame_size: frame.map(|f| f.to_string()),
            });
        }
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.available == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::tests::sample_new_class;
    use chrono::Utc;

    #[test]
    fn test_availability_counts_active_seats() {
        let class = Class::new(sample_new_class(4), Utc::now()).unwrap();
        let availability = Availability::calculate(&class, vec![None, None, None]);

        assert_eq!(availability.active, 3);
        assert_eq!(availability.available, 1);
        assert!(availability.has_seat(None));
        assert!(!availability.is_full());
    }

    #[test]
    fn test_availability_never_negative() {
        // Capacity lowered below bookings by hand: still floors at zero.
        let class = Class::new(sample_new_class(1), Utc::now()).unwrap();
        let availability = Availability::calculate(&class, vec![None, None]);

        assert_eq!(availability.available, 0);
        assert!(availability.is_full());
        assert!(matches!(
            availability.ensure_seat(None),
            Err(StudioError::CapacityExceeded { capacity: 1, active: 2, frame_size: None })
        ));
    }

    #[test]
    fn test_frame_bucket_exhaustion() {
        let mut new = sample_new_class(4);
        new.frame_capacity = BTreeMap::from([(FrameSize::Small, 2), (FrameSize::Large, 2)]);
        let class = Class::new(new, Utc::now()).unwrap();

        let availability = Availability::calculate(
            &class,
            vec![Some(FrameSize::Large), Some(FrameSize::Large)],
        );

        assert_eq!(availability.available, 2);
        assert!(availability.has_seat(Some(FrameSize::Small)));
        assert!(!availability.has_seat(Some(FrameSize::Large)));
        assert!(!availability.has_seat(Some(FrameSize::Medium)));

        let err = availability.ensure_seat(Some(FrameSize::Large)).unwrap_err();
        assert_eq!(
            err,
            StudioError::CapacityExceeded {
                capacity: 2,
                active: 2,
                frame_size: Some("LARGE".to_string()),
            }
        );
    }

    #[test]
    fn test_untagged_booking_on_framed_class_checks_overall_only() {
        let mut new = sample_new_class(2);
        new.frame_capacity = BTreeMap::from([(FrameSize::Medium, 2)]);
        let class = Class::new(new, Utc::now()).unwrap();

        let availability = Availability::calculate(&class, vec![Some(FrameSize::Medium)]);
        assert!(availability.has_seat(None));
    }
}
