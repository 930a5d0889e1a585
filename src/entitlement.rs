//! Entitlements: granted access to a product.

use crate::catalog::{OfferId, ProductId, ProviderId};
use crate::environment::Environment;
use crate::policy::applicability::ApplicabilityRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a license was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseType {
    /// Unspecified or unconditional (enterprise, EMM, QA unlocks).
    None,
    /// Time-boxed trial.
    Trial,
    /// Renewing subscription.
    Subscription,
    /// One-time purchase.
    Purchase,
}

/// Result of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    /// No entitlement data has been loaded yet.
    Unknown,
    /// Checked and not authorized.
    Denied,
    /// Was authorized, but the grant has expired.
    Expired,
    /// Authorized.
    Granted,
}

impl AuthorizationStatus {
    /// Rank by the ordering `Denied < Expired < Unknown < Granted`.
    pub fn favorability(self) -> u8 {
        match self {
            AuthorizationStatus::Denied => 0,
            AuthorizationStatus::Expired => 1,
            AuthorizationStatus::Unknown => 2,
            AuthorizationStatus::Granted => 3,
        }
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthorizationStatus::Unknown => "unknown",
            AuthorizationStatus::Denied => "denied",
            AuthorizationStatus::Expired => "expired",
            AuthorizationStatus::Granted => "granted",
        })
    }
}

/// A grant of access to a product.
///
/// Entitlements are immutable; providers replace their whole list on refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct Entitlement {
    /// Provider-specific identifier (e.g. an original transaction id).
    pub identifier: Option<String>,

    /// The provider that produced this entitlement.
    pub provider_id: ProviderId,

    /// The licensed product.
    pub product_id: ProductId,

    /// How the license was obtained.
    pub license_type: LicenseType,

    /// An invalid entitlement never grants access.
    pub valid: bool,

    /// Expiry (`None` = does not expire).
    pub expiry_date: Option<DateTime<Utc>>,

    /// When the status is expected to change next, for scheduling re-evaluation.
    pub next_status_change: Option<DateTime<Utc>>,

    /// Restricts the entitlement to matching environments (`None` = global).
    pub applicability: Option<ApplicabilityRule>,

    /// The offer this entitlement was obtained through, if any.
    pub offer_id: Option<OfferId>,
}

impl Entitlement {
    /// A valid, global, non-expiring entitlement.
    pub fn new(
        provider_id: impl Into<ProviderId>,
        product_id: impl Into<ProductId>,
        license_type: LicenseType,
    ) -> Self {
        Self {
            identifier: None,
            provider_id: provider_id.into(),
            product_id: product_id.into(),
            license_type,
            valid: true,
            expiry_date: None,
            next_status_change: None,
            applicability: None,
            offer_id: None,
        }
    }

    /// Set the identifier.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Set the validity flag.
    pub fn with_validity(mut self, valid: bool) -> Self {
        self.valid = valid;
        self
    }

    /// Expire at the given date; the expiry also becomes the next status change.
    pub fn expiring_at(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry_date = Some(expiry);
        self.next_status_change = Some(expiry);
        self
    }

    /// Restrict to environments matching the rule.
    pub fn applicable_when(mut self, rule: ApplicabilityRule) -> Self {
        self.applicability = Some(rule);
        self
    }

    /// Mark the offer this entitlement was obtained through.
    pub fn derived_from(mut self, offer_id: impl Into<OfferId>) -> Self {
        self.offer_id = Some(offer_id.into());
        self
    }

    /// Whether the entitlement applies in the environment. No rule means global.
    pub fn is_applicable_in(&self, environment: &Environment) -> bool {
        match &self.applicability {
            None => true,
            Some(rule) => rule.is_satisfied_by(environment),
        }
    }

    /// Whether the expiry date has passed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date.is_some_and(|expiry| expiry < now)
    }

    /// Evaluate this entitlement alone.
    pub fn authorization_status(
        &self,
        environment: &Environment,
        now: DateTime<Utc>,
    ) -> AuthorizationStatus {
        if !self.valid {
            return AuthorizationStatus::Denied;
        }
        if self.is_expired_at(now) {
            return AuthorizationStatus::Expired;
        }
        if !self.is_applicable_in(environment) {
            return AuthorizationStatus::Denied;
        }
        AuthorizationStatus::Granted
    }

    /// The next instant this entitlement's status may change, unless it has passed.
    ///
    /// An expiry equal to `now` is still upcoming; the entitlement expires just after it.
    pub fn upcoming_change(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        [self.next_status_change, self.expiry_date]
            .into_iter()
            .flatten()
            .filter(|at| *at >= now)
            .min()
    }
}
