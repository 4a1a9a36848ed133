//! Plaintext card records
//!
//! A [`Card`] only ever exists decrypted inside process memory. Image bytes
//! are kept out of the serialized record payload and travel as separately
//! encrypted assets; the payload references them through [`AssetRef`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroize;

/// Card category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardCategory {
    Credit,
    Debit,
    Loyalty,
    Id,
    Other,
}

/// An image attached to a card (front, back, barcode photo, ...)
#[derive(Clone, PartialEq, Eq)]
pub struct CardImage {
    pub id: Uuid,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl CardImage {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        CardImage {
            id: Uuid::new_v4(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Reference stored inside the encrypted record payload. `version`
    /// names the exact remote copy of the bytes.
    pub fn asset_ref(&self, version: impl Into<String>) -> AssetRef {
        AssetRef {
            id: self.id,
            version: version.into(),
            mime_type: self.mime_type.clone(),
            len: self.bytes.len() as u64,
        }
    }
}

impl fmt::Debug for CardImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardImage")
            .field("id", &self.id)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Drop for CardImage {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Pointer from a record payload to one encrypted image asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub id: Uuid,
    /// Content version; a changed image is written under a new name
    pub version: String,
    pub mime_type: String,
    pub len: u64,
}

impl AssetRef {
    /// Object name of this version below the record's asset prefix
    pub fn object_name(&self) -> String {
        format!("{}-{}", self.id, self.version)
    }
}

/// A card record
#[derive(Clone, PartialEq, Eq)]
pub struct Card {
    pub id: Uuid,
    pub category: CardCategory,
    pub nickname: String,
    pub number: Option<String>,
    pub last4: Option<String>,
    pub expiry: Option<String>,
    pub issue_date: Option<String>,
    pub cardholder_name: Option<String>,
    pub cvv: Option<String>,
    pub notes: Option<String>,
    pub images: Vec<CardImage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    /// Create a new card with a fresh id
    pub fn new(category: CardCategory, nickname: impl Into<String>) -> Self {
        let now = Utc::now();
        Card {
            id: Uuid::new_v4(),
            category,
            nickname: nickname.into(),
            number: None,
            last4: None,
            expiry: None,
            issue_date: None,
            cardholder_name: None,
            cvv: None,
            notes: None,
            images: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the card number, deriving `last4` from its digits
    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        let number = number.into();
        let digits: Vec<char> = number.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() >= 4 {
            self.last4 = Some(digits[digits.len() - 4..].iter().collect());
        }
        self.number = Some(number);
        self
    }

    pub fn with_image(mut self, image: CardImage) -> Self {
        self.images.push(image);
        self
    }

    /// Record a local modification
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Payload for the record object; `versions` holds one asset version
    /// per image, in image order
    pub(crate) fn to_payload(&self, versions: &[String]) -> CardPayload {
        CardPayload {
            id: self.id,
            category: self.category,
            nickname: self.nickname.clone(),
            number: self.number.clone(),
            last4: self.last4.clone(),
            expiry: self.expiry.clone(),
            issue_date: self.issue_date.clone(),
            cardholder_name: self.cardholder_name.clone(),
            cvv: self.cvv.clone(),
            notes: self.notes.clone(),
            assets: self
                .images
                .iter()
                .zip(versions)
                .map(|(image, version)| image.asset_ref(version.as_str()))
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("nickname", &self.nickname)
            .field("last4", &self.last4)
            .field("number", &self.number.as_ref().map(|_| "<redacted>"))
            .field("cvv", &self.cvv.as_ref().map(|_| "<redacted>"))
            .field("images", &self.images)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Serialized form of a card inside an encrypted record
#[derive(Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub(crate) struct CardPayload {
    #[zeroize(skip)]
    pub id: Uuid,
    #[zeroize(skip)]
    pub category: CardCategory,
    pub nickname: String,
    pub number: Option<String>,
    pub last4: Option<String>,
    pub expiry: Option<String>,
    pub issue_date: Option<String>,
    pub cardholder_name: Option<String>,
    pub cvv: Option<String>,
    pub notes: Option<String>,
    #[zeroize(skip)]
    pub assets: Vec<AssetRef>,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
    #[zeroize(skip)]
    pub updated_at: DateTime<Utc>,
}

impl CardPayload {
    /// Reassemble a card from its payload and the decrypted images, in
    /// payload order
    pub fn into_card(mut self, images: Vec<CardImage>) -> Card {
        Card {
            id: self.id,
            category: self.category,
            nickname: std::mem::take(&mut self.nickname),
            number: self.number.take(),
            last4: self.last4.take(),
            expiry: self.expiry.take(),
            issue_date: self.issue_date.take(),
            cardholder_name: self.cardholder_name.take(),
            cvv: self.cvv.take(),
            notes: self.notes.take(),
            images,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
