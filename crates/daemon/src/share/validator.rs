//! Share access rules.
//!
//! [`validate`] is a pure decision function: it never touches the store, so
//! a refused request never consumes quota. The checks run in a fixed order
//! (existence, action resolution, secret, expiry, quota, permission) and the
//! first failing check names the [`DenyReason`].

use super::{DenyReason, Share, ShareAction};

/// Parse the optional `action` request parameter.
///
/// `Ok(None)` means the caller did not ask for anything in particular.
pub fn parse_action(requested: Option<&str>) -> Result<Option<ShareAction>, DenyReason> {
    match requested.map(str::trim) {
        None | Some("") => Ok(None),
        Some("stream") => Ok(Some(ShareAction::Stream)),
        Some("download") => Ok(Some(ShareAction::Download)),
        Some(_) => Err(DenyReason::UnknownAction),
    }
}

/// Decide whether `share` may currently be used with `secret` for the
/// requested action. Returns the resolved action on success.
///
/// `share` is `None` when the lookup found nothing. `now` is unix seconds.
pub fn validate(
    share: Option<&Share>,
    secret: &str,
    requested: Option<&str>,
    now: i64,
) -> Result<ShareAction, DenyReason> {
    check(share, secret, requested, now, true)
}

/// Gate for per-track requests made from a playlist the share already
/// paid for: same rules as [`validate`] for streaming, minus the quota.
pub fn validate_follow_up(share: Option<&Share>, secret: &str, now: i64) -> Result<(), DenyReason> {
    check(share, secret, Some("stream"), now, false).map(|_| ())
}

fn check(
    share: Option<&Share>,
    secret: &str,
    requested: Option<&str>,
    now: i64,
    enforce_quota: bool,
) -> Result<ShareAction, DenyReason> {
    let share = share.ok_or(DenyReason::NotFound)?;

    let action = match parse_action(requested)? {
        Some(action) => action,
        None => share.default_action().ok_or(DenyReason::UnknownAction)?,
    };

    if share.secret != secret {
        return Err(DenyReason::InvalidSecret);
    }

    if share.is_expired(now) {
        return Err(DenyReason::Expired);
    }

    if enforce_quota && share.is_exhausted() {
        return Err(DenyReason::Exhausted);
    }

    if !share.allows(action) {
        return Err(DenyReason::ActionNotPermitted);
    }

    Ok(action)
}
