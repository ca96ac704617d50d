mod csv_readings;
mod push_api;

pub use csv_readings::{CsvReadingsParser, REQUIRED_CSV_COLUMNS};
pub use push_api::PushApiParser;
