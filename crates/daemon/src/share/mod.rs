//! Share records and the share access gate.
//!
//! A share grants an unauthenticated party access to one catalog object,
//! bounded by a secret, an optional expiry and an optional use counter.

pub mod validator;

pub use validator::{validate, validate_follow_up};

use crate::catalog::{is_part_of, CatalogError, ObjectCatalog};
use crate::object::ObjectRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const SECONDS_PER_DAY: i64 = 86_400;

/// Persisted share record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub id: i64,
    pub secret: String,
    pub object: ObjectRef,
    pub allow_stream: bool,
    pub allow_download: bool,
    /// Lifetime in days counted from `creation_date`; 0 never expires.
    pub expire_days: u32,
    /// Maximum number of uses; 0 is unlimited.
    pub max_counter: u32,
    pub counter: u32,
    pub creation_date: i64,
    pub lastvisit_date: i64,
}

impl Share {
    /// Unix time after which the share is unusable, if it expires at all.
    pub fn expire_date(&self) -> Option<i64> {
        if self.expire_days == 0 {
            return None;
        }
        Some(self.creation_date + i64::from(self.expire_days) * SECONDS_PER_DAY)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_date().is_some_and(|expires| expires < now)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_counter > 0 && self.counter >= self.max_counter
    }

    pub fn allows(&self, action: ShareAction) -> bool {
        match action {
            ShareAction::Stream => self.allow_stream,
            ShareAction::Download => self.allow_download,
        }
    }

    /// Action used when the request does not name one.
    pub fn default_action(&self) -> Option<ShareAction> {
        if self.allow_stream {
            Some(ShareAction::Stream)
        } else if self.allow_download {
            Some(ShareAction::Download)
        } else {
            None
        }
    }

    /// Whether `object` is the shared object or one of its container
    /// children, i.e. something a follow-up request may fetch.
    pub fn covers(
        &self,
        object: &ObjectRef,
        catalog: &dyn ObjectCatalog,
    ) -> Result<bool, CatalogError> {
        is_part_of(catalog, &self.object, object)
    }
}

/// Fields supplied when a share is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareDraft {
    pub secret: String,
    pub object: ObjectRef,
    pub allow_stream: bool,
    pub allow_download: bool,
    #[serde(default)]
    pub expire_days: u32,
    #[serde(default)]
    pub max_counter: u32,
}

/// A share draft that cannot be stored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid share: {0}")]
pub struct InvalidShare(pub String);

impl ShareDraft {
    /// Secrets travel unencoded in continuation URLs, so only characters
    /// that never need escaping in a query value are accepted.
    pub fn validate(&self) -> Result<(), InvalidShare> {
        if self.secret.is_empty() {
            return Err(InvalidShare("secret must not be empty".to_string()));
        }
        if let Some(bad) = self
            .secret
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(InvalidShare(format!(
                "secret may only contain letters, digits, '-' and '_' (found {:?})",
                bad
            )));
        }
        if !self.allow_stream && !self.allow_download {
            return Err(InvalidShare(
                "share must allow stream or download".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a share consumer asks to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareAction {
    Stream,
    Download,
}

impl ShareAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ShareAction::Stream => "stream",
            ShareAction::Download => "download",
        }
    }
}

impl fmt::Display for ShareAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a share request was refused. Server-side only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotFound,
    UnknownAction,
    InvalidSecret,
    Expired,
    Exhausted,
    ActionNotPermitted,
    FeatureDisabled,
    AddressNotAllowed,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::NotFound => "not_found",
            DenyReason::UnknownAction => "unknown_action",
            DenyReason::InvalidSecret => "invalid_secret",
            DenyReason::Expired => "expired",
            DenyReason::Exhausted => "exhausted",
            DenyReason::ActionNotPermitted => "action_not_permitted",
            DenyReason::FeatureDisabled => "feature_disabled",
            DenyReason::AddressNotAllowed => "address_not_allowed",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform denial. Display never includes the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("access denied")]
pub struct AccessDenied {
    pub reason: DenyReason,
}

impl From<DenyReason> for AccessDenied {
    fn from(reason: DenyReason) -> Self {
        Self { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;

    fn share(expire_days: u32, max_counter: u32, counter: u32) -> Share {
        Share {
            id: 1,
            secret: "abc".to_string(),
            object: ObjectRef::new(ObjectType::Song, 3),
            allow_stream: true,
            allow_download: false,
            expire_days,
            max_counter,
            counter,
            creation_date: 1_000_000,
            lastvisit_date: 0,
        }
    }

    #[test]
    fn test_expire_date_derived_from_days() {
        assert_eq!(share(0, 0, 0).expire_date(), None);
        assert_eq!(share(2, 0, 0).expire_date(), Some(1_000_000 + 2 * 86_400));
    }

    #[test]
    fn test_is_expired_only_strictly_after_expiry() {
        let s = share(1, 0, 0);
        let expiry = s.expire_date().unwrap();
        assert!(!s.is_expired(expiry));
        assert!(s.is_expired(expiry + 1));
        assert!(!share(0, 0, 0).is_expired(i64::MAX));
    }

    #[test]
    fn test_exhaustion_ignores_unlimited() {
        assert!(!share(0, 0, 500).is_exhausted());
        assert!(!share(0, 3, 2).is_exhausted());
        assert!(share(0, 3, 3).is_exhausted());
    }

    fn draft(secret: &str) -> ShareDraft {
        ShareDraft {
            secret: secret.to_string(),
            object: ObjectRef::new(ObjectType::Song, 3),
            allow_stream: true,
            allow_download: false,
            expire_days: 0,
            max_counter: 0,
        }
    }

    #[test]
    fn test_draft_secret_must_be_url_safe() {
        assert!(draft("Abc_123-x").validate().is_ok());
        for secret in ["", "a+b&c", "with space", "50%", "frag#ment", "caf\u{e9}"] {
            assert!(draft(secret).validate().is_err(), "{:?}", secret);
        }
    }

    #[test]
    fn test_draft_needs_an_action() {
        let mut d = draft("abc");
        d.allow_stream = false;
        assert_eq!(
            d.validate(),
            Err(InvalidShare("share must allow stream or download".to_string()))
        );
    }

    #[test]
    fn test_access_denied_display_hides_reason() {
        let denied = AccessDenied::from(DenyReason::InvalidSecret);
        assert_eq!(denied.to_string(), "access denied");
        assert_eq!(denied.reason, DenyReason::InvalidSecret);
    }
}
