pub mod class;
pub mod capacity;
pub mod holiday;
pub mod recurring;

pub use class::{Class, ClassStatus, FrameSize, NewClass};
pub use capacity::{Availability, FrameAvailability};
pub use holiday::{Holiday, HolidayCalendar};
pub use recurring::{
    GenerateRequest, GenerationOutcome, PatternError, PatternGenerator, RecurringClassPattern, SkipReason,
    SlotKey,
};
