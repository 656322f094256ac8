// 📍 Place Entity - Natural key (name) + storage surrogate id
//
// The surrogate id only links rows in storage. It takes no part in equality:
// two places are the same place when their names match.

use std::fmt;
use std::hash::{Hash, Hasher};

use super::client::is_blank;
use crate::error::ValidationError;
use crate::keys::string_hash;

/// Where a transaction happened
#[derive(Debug)]
pub struct Place {
    /// Assigned by storage; `None` until resolved
    id: Option<i64>,
    name: String,
}

impl Place {
    /// Build a place, or reject a blank name
    pub fn new(name: &str) -> Result<Self, ValidationError> {
        if is_blank(name) {
            return Err(ValidationError::blank("place", "place"));
        }

        Ok(Place {
            id: None,
            name: name.to_string(),
        })
    }

    /// A place already stored under surrogate `id`
    pub(crate) fn stored(id: i64, name: &str) -> Self {
        Place {
            id: Some(id),
            name: name.to_string(),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same as `==`: the surrogate id is not part of the value
    pub fn deep_eq(&self, other: &Place) -> bool {
        self == other
    }

    pub(crate) fn key_hash(&self) -> i32 {
        // 31 * 1 + h(name): hash of a one-element field list
        31i32.wrapping_add(string_hash(&self.name))
    }
}

impl PartialEq for Place {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Place {}

impl Hash for Place {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "Place{{id={}, placeName='{}'}}", id, self.name),
            None => write!(f, "Place{{placeName='{}'}}", self.name),
        }
    }
}
