//! CSV lead import with encoding detection.
//!
//! Field uploads frequently arrive as Shift_JIS or CP932; decoding is
//! tried as UTF-8 first, then Shift_JIS (whose decoder also covers
//! CP932), falling back to lossy UTF-8.

use serde::Serialize;

use crate::models::lead::validate_phone_number;

#[derive(Debug, thiserror::Error)]
pub enum CsvError {
    #[error("Empty CSV file")]
    Empty,

    #[error("Missing required column: phone_number")]
    MissingPhoneColumn,

    #[error("Invalid CSV format: {0}")]
    Invalid(String),
}

/// One valid row from the upload.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLead {
    pub phone_number: String,
    pub name: Option<String>,
    pub company: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
}

/// A row that failed validation; reported back to the caller.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RowError {
    pub row: usize,
    pub error: String,
}

#[derive(Debug)]
pub struct CsvParseResult {
    pub leads: Vec<ParsedLead>,
    pub errors: Vec<RowError>,
}

fn decode(content: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(content) {
        return text.to_string();
    }

    if let Some(text) = encoding_rs::SHIFT_JIS
        .decode_without_bom_handling_and_without_replacement(content)
    {
        return text.into_owned();
    }

    String::from_utf8_lossy(content).into_owned()
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Parse an uploaded CSV. The header row must contain `phone_number`
/// (case- and whitespace-insensitive); `name`, `company`, `email` and
/// `notes` are optional. Invalid rows land in `errors` instead of
/// aborting the import.
pub fn parse_csv(content: &[u8]) -> Result<CsvParseResult, CsvError> {
    if content.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(CsvError::Empty);
    }

    let text = decode(content);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| CsvError::Invalid(e.to_string()))?
        .clone();

    let column = |wanted: &str| -> Option<usize> {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(wanted))
    };

    let phone_idx = column("phone_number").ok_or(CsvError::MissingPhoneColumn)?;
    let name_idx = column("name");
    let company_idx = column("company");
    let email_idx = column("email");
    let notes_idx = column("notes");

    let mut leads = Vec::new();
    let mut errors = Vec::new();

    // Row 1 is the header
    for (offset, record) in reader.records().enumerate() {
        let row = offset + 2;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                errors.push(RowError {
                    row,
                    error: format!("Unreadable row: {e}"),
                });
                continue;
            }
        };

        let phone = record.get(phone_idx).map(str::trim).unwrap_or("");
        if phone.is_empty() {
            errors.push(RowError {
                row,
                error: "Empty phone number".to_string(),
            });
            continue;
        }
        if validate_phone_number(phone).is_err() {
            errors.push(RowError {
                row,
                error: format!("Invalid phone format: {phone}"),
            });
            continue;
        }

        let field = |idx: Option<usize>| clean(idx.and_then(|i| record.get(i)));
        leads.push(ParsedLead {
            phone_number: phone.to_string(),
            name: field(name_idx),
            company: field(company_idx),
            email: field(email_idx),
            notes: field(notes_idx),
        });
    }

    Ok(CsvParseResult { leads, errors })
}
