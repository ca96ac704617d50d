use serde_json::Value;

use crate::errors::{ParserError, RejectedRecord};
use crate::fields::normalize;
use crate::model::{ParsedBatch, RawRecord};
use crate::registry::ReadingsParser;

/// Parses `{"readings": [ {...}, ... ]}` bodies served by push-style tenant APIs.
pub struct PushApiParser;

impl PushApiParser {
    const NAME: &'static str = "PUSH_API_JSON";
}

impl ReadingsParser for PushApiParser {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parse(&self, body: &[u8]) -> Result<ParsedBatch, ParserError> {
        let document: Value = serde_json::from_slice(body).map_err(|source| ParserError::Json {
            parser: Self::NAME,
            source,
        })?;

        let readings = match document {
            Value::Object(mut object) => match object.remove("readings") {
                Some(Value::Array(items)) => items,
                Some(Value::Null) => Vec::new(),
                Some(other) => {
                    return Err(ParserError::Validation {
                        parser: Self::NAME,
                        message: format!("'readings' must be an array, found {}", kind(&other)),
                    })
                }
                None => {
                    return Err(ParserError::Validation {
                        parser: Self::NAME,
                        message: "body has no 'readings' field".to_string(),
                    })
                }
            },
            other => {
                return Err(ParserError::Validation {
                    parser: Self::NAME,
                    message: format!("expected a JSON object, found {}", kind(&other)),
                })
            }
        };

        let mut batch = ParsedBatch::default();
        for (position, item) in readings.into_iter().enumerate() {
            let index = position + 1;
            let fields = match item {
                Value::Object(fields) => fields,
                other => {
                    batch.rejected.push(RejectedRecord::new(
                        index,
                        format!("expected an object, found {}", kind(&other)),
                    ));
                    continue;
                }
            };

            let record = RawRecord::new(fields);
            match normalize(&record) {
                Ok(_) => batch.records.push(record),
                Err(err) => batch.rejected.push(RejectedRecord::new(index, err.to_string())),
            }
        }

        Ok(batch)
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
