//! User accounts, staff roles and referral codes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::ids::UserId;
use crate::dto::UpdateProfileRequest;
use crate::error::DomainError;

/// Staff role. A user with no roles is a plain client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Operator,
    Administrator,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Administrator => "administrator",
            Self::Owner => "owner",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operator" => Ok(Self::Operator),
            "administrator" => Ok(Self::Administrator),
            "owner" => Ok(Self::Owner),
            other => Err(DomainError::Validation(format!("Unknown role: {}", other))),
        }
    }
}

/// Verified identity handed over by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Provider subject (`sub` claim)
    pub external_id: String,
    pub email: String,
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: UserId,
    /// Subject identifier at the identity provider
    pub external_id: String,
    #[schema(example = "client@example.com")]
    pub email: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[schema(example = "+380501234567")]
    pub phone: Option<String>,
    pub telegram: Option<String>,
    /// Code other users enter to register as this user's referral
    #[schema(example = "3f9a1c2e")]
    pub referral_code: String,
    pub referred_by: Option<UserId>,
    #[schema(value_type = String, example = "0")]
    pub referral_balance: Decimal,
    pub roles: BTreeSet<Role>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Creates a user on first sign-in.
    pub fn from_identity(identity: &Identity) -> Result<Self, DomainError> {
        let email = identity.email.trim().to_lowercase();
        if !super::is_valid_email(&email) {
            return Err(DomainError::Validation(format!("Invalid email: {}", email)));
        }
        if identity.external_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "Identity subject cannot be empty".into(),
            ));
        }
        let username = email.split('@').next().unwrap_or_default().to_string();

        Ok(Self {
            id: UserId::new(),
            external_id: identity.external_id.clone(),
            email,
            username,
            first_name: None,
            last_name: None,
            phone: None,
            telegram: None,
            referral_code: generate_referral_code(),
            referred_by: None,
            referral_balance: Decimal::ZERO,
            roles: BTreeSet::new(),
            created_at: Utc::now(),
        })
    }

    pub fn is_staff(&self) -> bool {
        !self.roles.is_empty()
    }

    /// Applies profile edits. An empty string clears an optional field.
    pub fn apply_profile(&mut self, req: UpdateProfileRequest) -> Result<(), DomainError> {
        if let Some(username) = req.username {
            let username = username.trim().to_string();
            if username.is_empty() || username.chars().count() > 150 {
                return Err(DomainError::Validation(
                    "Username must be 1 to 150 characters".into(),
                ));
            }
            self.username = username;
        }
        if let Some(phone) = req.phone {
            let phone = clear_blank(phone);
            if let Some(p) = &phone {
                validate_phone(p)?;
            }
            self.phone = phone;
        }
        if let Some(first_name) = req.first_name {
            self.first_name = clear_blank(first_name);
        }
        if let Some(last_name) = req.last_name {
            self.last_name = clear_blank(last_name);
        }
        if let Some(telegram) = req.telegram {
            self.telegram = clear_blank(telegram);
        }
        Ok(())
    }

    /// Links this user to a referrer. Allowed once, never to oneself.
    pub fn apply_referral(&mut self, referrer: &User) -> Result<(), DomainError> {
        if referrer.id == self.id {
            return Err(DomainError::Validation(
                "You cannot use your own referral code".into(),
            ));
        }
        if self.referred_by.is_some() {
            return Err(DomainError::Validation(
                "A referral code has already been applied".into(),
            ));
        }
        self.referred_by = Some(referrer.id);
        Ok(())
    }
}

fn clear_blank(value: String) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Eight lowercase hex characters.
pub fn generate_referral_code() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// `+`, a non-zero digit, then 10 to 12 more digits.
pub fn validate_phone(phone: &str) -> Result<(), DomainError> {
    let digits = phone.strip_prefix('+').unwrap_or_default();
    let valid = phone.starts_with('+')
        && (11..=13).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0');
    if valid {
        Ok(())
    } else {
        Err(DomainError::Validation(
            "Phone number must be in format: '+380XXXXXXXXX'".into(),
        ))
    }
}
