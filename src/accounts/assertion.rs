//! Typed form of what an identity provider tells us about one sign-in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssertionError {
    #[error("provider is missing")]
    MissingProvider,
    #[error("uid is missing")]
    MissingUid,
    #[error("uid must be a string or a number")]
    InvalidUid,
}

/// Provider callback body as delivered by the identity exchange.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct ProviderCallback {
    pub provider: String,
    /// Some providers send numeric ids.
    #[serde(default)]
    #[schema(value_type = String, example = "42")]
    pub uid: Value,
    #[serde(default)]
    pub info: ProviderInfo,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct ProviderInfo {
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

/// A validated external identity assertion for a single sign-in attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assertion {
    provider: String,
    uid: String,
    display_name: String,
    email: Option<String>,
}

impl Assertion {
    /// # Errors
    /// Returns an error if provider or uid is blank.
    pub fn new(
        provider: impl Into<String>,
        uid: impl Into<String>,
        display_name: impl Into<String>,
        email: Option<String>,
    ) -> Result<Self, AssertionError> {
        let provider = provider.into();
        if provider.trim().is_empty() {
            return Err(AssertionError::MissingProvider);
        }
        let uid = uid.into();
        if uid.is_empty() {
            return Err(AssertionError::MissingUid);
        }
        Ok(Self {
            provider,
            uid,
            display_name: display_name.into(),
            email: email.filter(|email| !email.trim().is_empty()),
        })
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Local-credential sign-ins never vouch for the email address.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.provider.to_lowercase().contains(super::LOCAL_PROVIDER)
    }
}

impl TryFrom<ProviderCallback> for Assertion {
    type Error = AssertionError;

    fn try_from(callback: ProviderCallback) -> Result<Self, Self::Error> {
        let uid = match callback.uid {
            Value::String(uid) => uid,
            Value::Number(uid) => uid.to_string(),
            Value::Null => return Err(AssertionError::MissingUid),
            _ => return Err(AssertionError::InvalidUid),
        };
        let ProviderInfo {
            name,
            first_name,
            last_name,
            email,
        } = callback.info;

        // Providers without a single display name send the parts instead.
        let display_name = name.unwrap_or_else(|| {
            format!(
                "{} {}",
                first_name.unwrap_or_default(),
                last_name.unwrap_or_default()
            )
            .trim()
            .to_string()
        });

        Self::new(callback.provider, uid, display_name, email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn callback(value: Value) -> Result<Assertion, AssertionError> {
        let callback: ProviderCallback = match serde_json::from_value(value) {
            Ok(callback) => callback,
            Err(_) => return Err(AssertionError::InvalidUid),
        };
        Assertion::try_from(callback)
    }

    #[test]
    fn uses_single_display_name_when_present() {
        let assertion = callback(json!({
            "provider": "twitter",
            "uid": "42",
            "info": { "name": "Alice", "first_name": "Ignored", "email": "alice@example.com" }
        }));
        let Ok(assertion) = assertion else {
            panic!("expected a valid assertion");
        };
        assert_eq!(assertion.provider(), "twitter");
        assert_eq!(assertion.uid(), "42");
        assert_eq!(assertion.display_name(), "Alice");
        assert_eq!(assertion.email(), Some("alice@example.com"));
    }

    #[test]
    fn joins_first_and_last_name_without_display_name() {
        let assertion = callback(json!({
            "provider": "foursquare",
            "uid": "7",
            "info": { "first_name": "Jane", "last_name": "Doe" }
        }));
        assert_eq!(
            assertion.as_ref().map(Assertion::display_name),
            Ok("Jane Doe")
        );
    }

    #[test]
    fn missing_name_parts_default_to_empty() {
        let assertion = callback(json!({
            "provider": "foursquare",
            "uid": "7",
            "info": { "last_name": "Doe" }
        }));
        assert_eq!(assertion.as_ref().map(Assertion::display_name), Ok("Doe"));

        let assertion = callback(json!({ "provider": "foursquare", "uid": "7" }));
        assert_eq!(assertion.as_ref().map(Assertion::display_name), Ok(""));
    }

    #[test]
    fn numeric_uid_is_coerced_to_string() {
        let assertion = callback(json!({ "provider": "facebook", "uid": 1_234_567 }));
        assert_eq!(assertion.as_ref().map(Assertion::uid), Ok("1234567"));
    }

    #[test]
    fn rejects_missing_or_structured_uid() {
        assert_eq!(
            callback(json!({ "provider": "twitter", "uid": null })),
            Err(AssertionError::MissingUid)
        );
        assert_eq!(
            callback(json!({ "provider": "twitter", "uid": "" })),
            Err(AssertionError::MissingUid)
        );
        assert_eq!(
            callback(json!({ "provider": "twitter", "uid": { "id": 1 } })),
            Err(AssertionError::InvalidUid)
        );
    }

    #[test]
    fn rejects_blank_provider() {
        assert_eq!(
            Assertion::new(" ", "1", "Bob", None),
            Err(AssertionError::MissingProvider)
        );
    }

    #[test]
    fn blank_email_is_dropped() {
        let assertion = Assertion::new("twitter", "1", "Bob", Some("  ".to_string()));
        assert_eq!(assertion.map(|a| a.email().is_none()), Ok(true));
    }

    #[test]
    fn local_provider_detection_ignores_case() {
        let local = Assertion::new("Identity", "Bob", "Bob", None);
        assert_eq!(local.map(|a| a.is_local()), Ok(true));
        let remote = Assertion::new("twitter", "1", "Bob", None);
        assert_eq!(remote.map(|a| a.is_local()), Ok(false));
    }
}
