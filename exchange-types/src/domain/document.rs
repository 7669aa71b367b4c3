//! Documents attached to an order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::ids::{DocumentId, OrderId, UserId};
use crate::error::DomainError;

/// Kind of evidence attached to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    /// Payment receipt
    Receipt,
    /// Screenshot or export of the client conversation
    Chat,
}

impl DocumentType {
    /// Every type an order must carry before it can be completed.
    pub const REQUIRED_FOR_COMPLETION: [DocumentType; 2] = [DocumentType::Receipt, DocumentType::Chat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Receipt => "receipt",
            Self::Chat => "chat",
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "receipt" => Ok(Self::Receipt),
            "chat" => Ok(Self::Chat),
            other => Err(DomainError::Validation(format!(
                "Unknown document type: {}",
                other
            ))),
        }
    }
}

/// Reference to an uploaded file. The file itself lives in external storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrderDocument {
    pub id: DocumentId,
    pub order_id: OrderId,
    pub doc_type: DocumentType,
    /// Opaque handle into file storage
    #[schema(example = "uploads/2024/05/receipt-0001.pdf")]
    pub file_handle: String,
    pub uploaded_by: Option<UserId>,
    pub uploaded_at: DateTime<Utc>,
}

impl OrderDocument {
    pub fn new(
        order_id: OrderId,
        doc_type: DocumentType,
        file_handle: String,
        uploaded_by: Option<UserId>,
    ) -> Result<Self, DomainError> {
        let file_handle = file_handle.trim().to_string();
        if file_handle.is_empty() {
            return Err(DomainError::Validation(
                "Document file handle cannot be empty".into(),
            ));
        }
        Ok(Self {
            id: DocumentId::new(),
            order_id,
            doc_type,
            file_handle,
            uploaded_by,
            uploaded_at: Utc::now(),
        })
    }
}
