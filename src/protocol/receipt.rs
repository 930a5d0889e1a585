//! App Store receipt records and their JSON interchange form.
//!
//! The binary PKCS#7/ASN.1 receipt decoder is an external collaborator: it
//! hands the App Store provider one [`ReceiptRecord`] per in-app purchase,
//! or one [`ReceiptParseError`] kind. Receipts that were already decoded
//! (e.g. by a validation server) arrive in the `verifyReceipt` JSON layout
//! and are parsed here.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;

/// One in-app purchase entry of a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptRecord {
    /// App Store product identifier.
    pub product_id: String,
    /// Transaction identifier.
    pub transaction_id: String,
    /// Identifier of the original purchase (stable across renewals and restores).
    pub original_transaction_id: Option<String>,
    /// Purchase or renewal date.
    pub purchase_date: Option<DateTime<Utc>>,
    /// Date of the original purchase.
    pub original_purchase_date: Option<DateTime<Utc>>,
    /// Set when the purchase was refunded or revoked.
    pub cancellation_date: Option<DateTime<Utc>>,
    /// Expiry of an auto-renewable subscription period.
    pub subscription_expiration_date: Option<DateTime<Utc>>,
    /// Number of items purchased.
    pub quantity: u32,
    /// Subscription purchase event identifier.
    pub web_order_line_item_id: Option<u64>,
    /// The subscription period is an introductory (trial) period.
    pub in_intro_offer_period: bool,
}

/// Why a receipt yielded no records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ReceiptParseError {
    /// No receipt is present.
    #[error("no receipt")]
    NoReceipt,
    /// The root CA certificate is unavailable.
    #[error("no root CA certificate")]
    NoRootCa,
    /// The device identifier is unavailable.
    #[error("no device identifier")]
    NoDeviceId,
    /// The container could not be decoded.
    #[error("PKCS7 container could not be decoded")]
    Pkcs7Decode,
    /// The container carries no signature.
    #[error("PKCS7 container is unsigned")]
    Pkcs7Unsigned,
    /// The container contents are not data.
    #[error("PKCS7 contents are not data")]
    Pkcs7ContentsNotData,
    /// The certificate store could not be set up.
    #[error("X509 store error")]
    X509Store,
    /// The certificate could not be loaded.
    #[error("X509 certificate error")]
    X509Certificate,
    /// Signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,
    /// The payload is not an ASN.1 set.
    #[error("payload is not a set")]
    Asn1NotASet,
    /// A field had an unexpected type.
    #[error("unexpected field type")]
    Asn1UnexpectedType,
    /// A decoded receipt document is not valid JSON.
    #[error("receipt document is not valid JSON")]
    MalformedDocument,
}

/// Future returned by [`ReceiptSupplier::in_app_purchases`].
pub type ReceiptFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<ReceiptRecord>, ReceiptParseError>> + Send + 'a>>;

/// Source of parsed receipt records.
pub trait ReceiptSupplier: Send + Sync {
    /// Parse the current receipt.
    fn in_app_purchases(&self) -> ReceiptFuture<'_>;
}

/// `verifyReceipt`-style JSON document.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedReceipt {
    /// 0 on success; 21003 when the receipt could not be authenticated.
    pub status: i64,
    /// Decoded receipt.
    #[serde(default)]
    pub receipt: Option<VerifiedReceiptBody>,
    /// Latest renewal transactions, when present.
    #[serde(default)]
    pub latest_receipt_info: Option<serde_json::Value>,
}

/// Receipt body of a [`VerifiedReceipt`].
#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedReceiptBody {
    /// Bundle identifier.
    #[serde(default)]
    pub bundle_id: Option<String>,
    /// In-app purchase entries; must be an array.
    #[serde(default)]
    pub in_app: serde_json::Value,
}

/// One `in_app` entry. Dates are milliseconds since the epoch, encoded as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct RawInAppPurchase {
    /// Product identifier.
    pub product_id: String,
    /// Transaction identifier.
    pub transaction_id: String,
    /// Original transaction identifier.
    #[serde(default)]
    pub original_transaction_id: Option<String>,
    /// Purchase date.
    #[serde(default)]
    pub purchase_date_ms: Option<String>,
    /// Original purchase date.
    #[serde(default)]
    pub original_purchase_date_ms: Option<String>,
    /// Cancellation date.
    #[serde(default)]
    pub cancellation_date_ms: Option<String>,
    /// Subscription expiry.
    #[serde(default)]
    pub expires_date_ms: Option<String>,
    /// Quantity.
    #[serde(default)]
    pub quantity: Option<String>,
    /// Web order line item id.
    #[serde(default)]
    pub web_order_line_item_id: Option<String>,
    /// "true" during an introductory period.
    #[serde(default)]
    pub is_in_intro_offer_period: Option<String>,
}

const STATUS_NOT_AUTHENTICATED: i64 = 21003;

fn parse_millis(value: Option<&String>) -> Result<Option<DateTime<Utc>>, ReceiptParseError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let millis: i64 = raw
        .parse()
        .map_err(|_| ReceiptParseError::Asn1UnexpectedType)?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(Some)
        .ok_or(ReceiptParseError::Asn1UnexpectedType)
}

impl TryFrom<RawInAppPurchase> for ReceiptRecord {
    type Error = ReceiptParseError;

    fn try_from(raw: RawInAppPurchase) -> Result<Self, Self::Error> {
        let quantity = match raw.quantity.as_deref() {
            Some(q) => q.parse().map_err(|_| ReceiptParseError::Asn1UnexpectedType)?,
            None => 1,
        };
        let web_order_line_item_id = match raw.web_order_line_item_id.as_deref() {
            Some(id) => Some(id.parse().map_err(|_| ReceiptParseError::Asn1UnexpectedType)?),
            None => None,
        };

        Ok(Self {
            purchase_date: parse_millis(raw.purchase_date_ms.as_ref())?,
            original_purchase_date: parse_millis(raw.original_purchase_date_ms.as_ref())?,
            cancellation_date: parse_millis(raw.cancellation_date_ms.as_ref())?,
            subscription_expiration_date: parse_millis(raw.expires_date_ms.as_ref())?,
            product_id: raw.product_id,
            transaction_id: raw.transaction_id,
            original_transaction_id: raw.original_transaction_id,
            quantity,
            web_order_line_item_id,
            in_intro_offer_period: raw.is_in_intro_offer_period.as_deref() == Some("true"),
        })
    }
}

/// Parse a `verifyReceipt` JSON document into records.
pub fn parse_verified_receipt(body: &[u8]) -> Result<Vec<ReceiptRecord>, ReceiptParseError> {
    let document: VerifiedReceipt =
        serde_json::from_slice(body).map_err(|_| ReceiptParseError::MalformedDocument)?;

    if document.status == STATUS_NOT_AUTHENTICATED {
        return Err(ReceiptParseError::SignatureVerification);
    }
    if document.status != 0 {
        return Err(ReceiptParseError::Pkcs7ContentsNotData);
    }

    let receipt = document.receipt.ok_or(ReceiptParseError::Pkcs7ContentsNotData)?;
    let entries = match receipt.in_app {
        serde_json::Value::Null => return Ok(Vec::new()),
        serde_json::Value::Array(entries) => entries,
        _ => return Err(ReceiptParseError::Asn1NotASet),
    };

    entries
        .into_iter()
        .map(|entry| {
            let raw: RawInAppPurchase =
                serde_json::from_value(entry).map_err(|_| ReceiptParseError::Asn1UnexpectedType)?;
            ReceiptRecord::try_from(raw)
        })
        .collect()
}

/// Supplier reading a `verifyReceipt` JSON document from disk on every call.
#[derive(Debug, Clone)]
pub struct VerifiedReceiptFile {
    path: PathBuf,
}

impl VerifiedReceiptFile {
    /// Read receipts from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReceiptSupplier for VerifiedReceiptFile {
    fn in_app_purchases(&self) -> ReceiptFuture<'_> {
        Box::pin(async move {
            let body = tokio::fs::read(&self.path)
                .await
                .map_err(|_| ReceiptParseError::NoReceipt)?;
            parse_verified_receipt(&body)
        })
    }
}
