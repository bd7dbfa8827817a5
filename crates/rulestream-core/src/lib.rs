pub mod csv;
pub mod error;
pub mod fact;
pub mod hit;
pub mod search;
pub mod user;

pub use csv::{CsvColumn, CsvParameters};
pub use error::{CoreError, Result};
pub use fact::{Fact, FactId, FactParameters};
pub use hit::{Hit, HitBatch, lookup_field};
pub use search::SearchSpec;
pub use user::UserRef;
