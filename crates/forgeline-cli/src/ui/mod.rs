//! Terminal output.

mod output;

pub use output::{error, header, info, kv, success, table_row, warning};
