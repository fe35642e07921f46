pub mod timezone;

pub use timezone::{document_stamp, parse_timezone, store_now};
