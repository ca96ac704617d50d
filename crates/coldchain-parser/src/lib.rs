pub mod errors;
pub mod fields;
pub mod formats;
pub mod model;
mod registry;

pub use errors::{FieldError, ParserError, RejectedRecord};
pub use fields::{normalize, EquipmentStatus, NormalizedReading, TemperatureUnit};
pub use model::{ParsedBatch, RawRecord};
pub use registry::{parse_readings, parser_for, ReadingsParser, SourceFormat};

#[cfg(test)]
mod tests;
