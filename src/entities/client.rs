// 👤 Client Entity - Natural key (inn) + name values
//
// "The tax number is the IDENTITY, the names are VALUES"
//
// - Two clients are equal when their inn matches, whatever the names say
// - `deep_eq` compares every field, for verification code
// - No Clone: a client is shared by reference, never duplicated

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::ValidationError;
use crate::keys::string_hash;

const INN_LENGTH: usize = 10;

// ============================================================================
// CLIENT ENTITY
// ============================================================================

/// Person a transaction belongs to
#[derive(Debug)]
pub struct Client {
    /// Natural key: 10 digits, not all zeros
    inn: String,
    first_name: String,
    last_name: String,
    middle_name: String,
}

impl Client {
    /// Build a client, or explain which input was rejected
    pub fn new(
        first_name: &str,
        last_name: &str,
        middle_name: &str,
        inn: &str,
    ) -> Result<Self, ValidationError> {
        if !is_valid_inn(inn) {
            return Err(ValidationError::Inn(inn.to_string()));
        }
        if is_blank(first_name) {
            return Err(ValidationError::blank("client", "firstName"));
        }
        if is_blank(last_name) {
            return Err(ValidationError::blank("client", "lastName"));
        }
        if is_blank(middle_name) {
            return Err(ValidationError::blank("client", "middleName"));
        }

        Ok(Client {
            inn: inn.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            middle_name: middle_name.to_string(),
        })
    }

    /// Rebuild a client from a row that passed `new` when it was written
    pub(crate) fn stored(inn: &str, first_name: &str, last_name: &str, middle_name: &str) -> Self {
        Client {
            inn: inn.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            middle_name: middle_name.to_string(),
        }
    }

    pub fn inn(&self) -> &str {
        &self.inn
    }

    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    pub fn middle_name(&self) -> &str {
        &self.middle_name
    }

    /// Ignored when blank
    pub fn set_first_name(&mut self, first_name: &str) {
        if !is_blank(first_name) {
            self.first_name = first_name.to_string();
        }
    }

    /// Ignored when blank
    pub fn set_last_name(&mut self, last_name: &str) {
        if !is_blank(last_name) {
            self.last_name = last_name.to_string();
        }
    }

    /// Ignored when blank
    pub fn set_middle_name(&mut self, middle_name: &str) {
        if !is_blank(middle_name) {
            self.middle_name = middle_name.to_string();
        }
    }

    /// Compare every field, not just the inn
    pub fn deep_eq(&self, other: &Client) -> bool {
        self.inn == other.inn
            && self.first_name == other.first_name
            && self.last_name == other.last_name
            && self.middle_name == other.middle_name
    }

    /// Contribution of this client to a transaction key seed
    pub(crate) fn key_hash(&self) -> i32 {
        string_hash(&self.inn)
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        self.inn == other.inn
    }
}

impl Eq for Client {}

impl Hash for Client {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inn.hash(state);
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Client{{inn='{}', firstName='{}', lastName='{}', middleName='{}'}}",
            self.inn, self.first_name, self.last_name, self.middle_name
        )
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn is_valid_inn(inn: &str) -> bool {
    inn.len() == INN_LENGTH
        && inn.bytes().all(|b| b.is_ascii_digit())
        && inn.bytes().any(|b| b != b'0')
}

pub(crate) fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}
