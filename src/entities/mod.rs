// Entity Models
// Natural keys identify, values describe:
//
// - Client: identity = inn, values = names
// - Place: identity = name, plus a storage-only surrogate id
// - Transaction: identity = derived id, values = amount/currency/card + refs
//
// Factories validate everything and return a `ValidationError` instead of a
// half-built value. None of the types implement Clone.

pub mod client;
pub mod place;
pub mod transaction;

pub use client::Client;
pub use place::Place;
pub use transaction::Transaction;
