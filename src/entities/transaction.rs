// 💳 Transaction Entity - Derived id + amount/currency/card + client/place refs
//
// The id is never supplied. It is derived when the transaction is built, from
// its values and its serial position in the feed (see `keys`).

use rust_decimal::Decimal;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::client::is_blank;
use super::{Client, Place};
use crate::error::ValidationError;
use crate::keys::{derive_key, KeyRegistry};

/// One ingested record
#[derive(Debug)]
pub struct Transaction {
    id: i64,
    serial: u32,
    amount: Decimal,
    currency: String,
    card: String,
    client: Arc<Client>,
    place: Arc<Place>,
}

impl Transaction {
    /// Validate inputs, then derive and claim the id in `keys`
    pub fn new(
        amount: Decimal,
        currency: &str,
        card: &str,
        client: Arc<Client>,
        place: Arc<Place>,
        serial: u32,
        keys: &KeyRegistry,
    ) -> Result<Self, ValidationError> {
        if amount <= Decimal::ZERO {
            return Err(ValidationError::Amount(amount.to_string()));
        }
        if is_blank(currency) {
            return Err(ValidationError::blank("transaction", "currency"));
        }
        if is_blank(card) {
            return Err(ValidationError::blank("transaction", "card"));
        }
        if serial == 0 {
            return Err(ValidationError::Serial);
        }

        let id = derive_key(keys, &amount, currency, card, &client, &place, serial);

        Ok(Transaction {
            id,
            serial,
            amount,
            currency: currency.to_string(),
            card: card.to_string(),
            client,
            place,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// 1-based position in the feed
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn amount(&self) -> &Decimal {
        &self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn place(&self) -> &Arc<Place> {
        &self.place
    }

    /// Ignored unless strictly positive
    pub fn set_amount(&mut self, amount: Decimal) {
        if amount > Decimal::ZERO {
            self.amount = amount;
        }
    }

    /// Ignored when blank
    pub fn set_currency(&mut self, currency: &str) {
        if !is_blank(currency) {
            self.currency = currency.to_string();
        }
    }

    /// Ignored when blank
    pub fn set_card(&mut self, card: &str) {
        if !is_blank(card) {
            self.card = card.to_string();
        }
    }

    pub fn set_client(&mut self, client: Arc<Client>) {
        self.client = client;
    }

    pub fn set_place(&mut self, place: Arc<Place>) {
        self.place = place;
    }

    /// Compare id, values and the full value of client and place
    pub fn deep_eq(&self, other: &Transaction) -> bool {
        self.id == other.id
            && self.amount == other.amount
            && self.currency == other.currency
            && self.card == other.card
            && self.client.deep_eq(&other.client)
            && self.place.deep_eq(&other.place)
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}

impl Hash for Transaction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trans{{id={}, amount={}, currency='{}', card='{}', client={}, place={}}}",
            self.id, self.amount, self.currency, self.card, self.client, self.place
        )
    }
}
