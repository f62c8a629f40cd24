pub mod code;
pub mod marketplace;

pub use code::{extract_code, ListingCode};
pub use marketplace::{host_of, resolve_marketplace};
