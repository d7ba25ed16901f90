use serde::{Deserialize, Serialize};
use tuft_shared::Masked;
use uuid::Uuid;

use crate::{StudioError, StudioResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Instructor,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Instructor => "INSTRUCTOR",
            Role::Student => "STUDENT",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Role::Admin),
            "INSTRUCTOR" => Ok(Role::Instructor),
            "STUDENT" => Ok(Role::Student),
            other => Err(StudioError::ValidationError(format!("unknown role {}", other))),
        }
    }
}

/// An already-authenticated identity. The session provider resolves it, the
/// core only re-checks ownership against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
    pub email: Option<Masked<String>>,
}

impl Caller {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role, email: None }
    }

    pub fn student(user_id: Uuid) -> Self {
        Self::new(user_id, Role::Student)
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self::new(user_id, Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins and instructors.
    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Instructor)
    }

    /// Students may only act on their own rows; staff may act for anyone.
    pub fn ensure_can_act_for(&self, owner_id: Uuid, what: &str) -> StudioResult<()> {
        if self.is_staff() || self.user_id == owner_id {
            Ok(())
        } else {
            Err(StudioError::Unauthorized(format!(
                "{} belongs to another user",
                what
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_students_only_act_for_themselves() {
        let me = Uuid::new_v4();
        let someone_else = Uuid::new_v4();
        let caller = Caller::student(me);

        assert!(caller.ensure_can_act_for(me, "reservation").is_ok());
        assert!(matches!(
            caller.ensure_can_act_for(someone_else, "reservation"),
            Err(StudioError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_staff_act_for_anyone() {
        let instructor = Caller::new(Uuid::new_v4(), Role::Instructor);
        assert!(instructor.is_staff());
        assert!(!instructor.is_admin());
        assert!(instructor.ensure_can_act_for(Uuid::new_v4(), "reservation").is_ok());
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("STUDENT".parse::<Role>().unwrap(), Role::Student);
        assert!("GUEST".parse::<Role>().is_err());
    }
}
