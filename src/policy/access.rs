//! Status combination rules.
//!
//! This module decides how several per-entitlement statuses fold into one:
//! - Within a feature or product, the most favorable status wins
//!   (a user keeps access while any grant path is still valid)
//! - Across an observer's watch-set, the least favorable status wins
//!   (everything watched must be authorized)

use crate::entitlement::AuthorizationStatus;

/// Combine the statuses of the entitlements relevant to one feature or product.
///
/// # Returns
/// * `Granted` - at least one entitlement is granted
/// * `Expired` - none granted, at least one expired
/// * `Unknown` - no entitlements and data is still loading (`pending`)
/// * `Denied` - otherwise
pub fn combine_grant_paths<I>(statuses: I, pending: bool) -> AuthorizationStatus
where
    I: IntoIterator<Item = AuthorizationStatus>,
{
    let mut seen_any = false;
    let mut expired = false;

    for status in statuses {
        seen_any = true;
        match status {
            AuthorizationStatus::Granted => return AuthorizationStatus::Granted,
            AuthorizationStatus::Expired => expired = true,
            AuthorizationStatus::Denied | AuthorizationStatus::Unknown => {}
        }
    }

    if expired {
        AuthorizationStatus::Expired
    } else if !seen_any && pending {
        AuthorizationStatus::Unknown
    } else {
        AuthorizationStatus::Denied
    }
}

/// Combine the statuses of several watched identifiers.
///
/// An empty watch-set is `Unknown`; otherwise the least favorable status
/// by the ordering `Denied < Expired < Unknown < Granted`.
pub fn combine_watch_set<I>(statuses: I) -> AuthorizationStatus
where
    I: IntoIterator<Item = AuthorizationStatus>,
{
    statuses
        .into_iter()
        .min_by_key(|status| status.favorability())
        .unwrap_or(AuthorizationStatus::Unknown)
}
