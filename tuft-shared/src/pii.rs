use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Contact details (student email, phone) that must never show up in logs.
///
/// `Debug` and `Display` print a placeholder; serialization passes the real
/// value through because notification payloads need it.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Masked<T>(pub T);

const PLACEHOLDER: &str = "********";

impl<T> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PLACEHOLDER)
    }
}

impl<T> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PLACEHOLDER)
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Masked<T> {
    fn from(value: T) -> Self {
        Masked(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_value() {
        let email: Masked<String> = "student@example.com".to_string().into();
        assert_eq!(format!("{:?}", email), PLACEHOLDER);
        assert_eq!(format!("{}", email), PLACEHOLDER);
        assert_eq!(email.expose(), "student@example.com");
    }

    #[test]
    fn test_serialize_passes_through() {
        let email = Masked("student@example.com".to_string());
        let json = serde_json::to_string(&email).unwrap();
        assert_eq!(json, "\"student@example.com\"");

        let back: Masked<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.into_inner(), "student@example.com");
    }
}
