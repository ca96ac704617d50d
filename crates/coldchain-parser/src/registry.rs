use serde::{Deserialize, Serialize};

use crate::errors::ParserError;
use crate::formats::{CsvReadingsParser, PushApiParser};
use crate::model::ParsedBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    PushApiJson,
    Csv,
}

pub trait ReadingsParser: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, body: &[u8]) -> Result<ParsedBatch, ParserError>;
}

pub fn parser_for(format: SourceFormat) -> &'static dyn ReadingsParser {
    match format {
        SourceFormat::PushApiJson => &PushApiParser,
        SourceFormat::Csv => &CsvReadingsParser,
    }
}

pub fn parse_readings(format: SourceFormat, body: &[u8]) -> Result<ParsedBatch, ParserError> {
    parser_for(format).parse(body)
}
