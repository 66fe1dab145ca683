//! Document records handed over by the extraction stage.
//!
//! Input arrives as JSON lines (one record per line) or as the JSON array the
//! ETL step writes. Each record is validated on its own so one bad record can
//! be skipped without losing the rest of the batch.

use std::io::BufRead;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RagError, Result};

/// Immutable extracted document ready for chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable document identifier.
    pub id: String,
    /// Page or file the text was extracted from.
    pub source_url: String,
    /// Publication title.
    pub title: String,
    /// Publication date when the source lists one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_on: Option<NaiveDate>,
    /// When the crawler fetched the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieved_at: Option<DateTime<Utc>>,
    /// Normalised body text.
    pub raw_text: String,
    /// Tables extracted alongside the text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<DocumentTable>,
}

/// One extracted table; cells may be empty where the extractor found nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentTable {
    /// Optional caption or heading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Row-major cells.
    #[serde(default)]
    pub rows: Vec<Vec<Option<String>>>,
}

impl DocumentTable {
    /// Renders the table as pipe-separated rows under its caption.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(caption) = self.caption.as_deref().map(str::trim) {
            if !caption.is_empty() {
                out.push_str("Table: ");
                out.push_str(caption);
            }
        }
        for row in &self.rows {
            let cells: Vec<String> = row
                .iter()
                .map(|cell| collapse_whitespace(cell.as_deref().unwrap_or_default()))
                .collect();
            if cells.iter().all(|cell| cell.is_empty()) {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&cells.join(" | "));
        }
        out
    }
}

impl Document {
    /// Text the chunker splits: the body, then each non-empty rendered table.
    pub fn normalized_text(&self, include_tables: bool) -> String {
        if !include_tables || self.tables.is_empty() {
            return self.raw_text.clone();
        }
        let mut text = self.raw_text.clone();
        for table in &self.tables {
            let rendered = table.render();
            if rendered.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(&rendered);
        }
        text
    }

    /// Validates a loosely-typed record into a document.
    ///
    /// `position` labels the record in errors when its id is missing.
    pub fn from_record(record: DocumentRecord, position: usize) -> Result<Self> {
        let label = record
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("record #{position}"));

        let id = required(record.id, &label, "id")?;
        let title = required(record.title, &label, "title")?;
        let source_url = required(record.source_url, &label, "source_url")?;
        Url::parse(&source_url)
            .map_err(|err| RagError::malformed(&label, format!("invalid source_url: {err}")))?;
        let raw_text = record
            .raw_text
            .ok_or_else(|| RagError::malformed(&label, "raw_text missing"))?;
        let published_on = match record.published_on.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(value) => Some(
                parse_date(value)
                    .ok_or_else(|| RagError::malformed(&label, format!("invalid date '{value}'")))?,
            ),
        };

        Ok(Self {
            id,
            source_url,
            title,
            published_on,
            retrieved_at: record.retrieved_at,
            raw_text,
            tables: record.tables,
        })
    }
}

/// Raw input record; every field is optional until validated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentRecord {
    /// Document identifier.
    #[serde(default)]
    pub id: Option<String>,
    /// Source URL (`url` accepted as an alias).
    #[serde(default, alias = "url")]
    pub source_url: Option<String>,
    /// Title.
    #[serde(default)]
    pub title: Option<String>,
    /// Publication date (`date_published` accepted as an alias).
    #[serde(default, alias = "date_published")]
    pub published_on: Option<String>,
    /// Fetch timestamp.
    #[serde(default)]
    pub retrieved_at: Option<DateTime<Utc>>,
    /// Body text (`text_content` accepted as an alias).
    #[serde(default, alias = "text_content")]
    pub raw_text: Option<String>,
    /// Extracted tables.
    #[serde(default)]
    pub tables: Vec<DocumentTable>,
}

/// Reads one document per non-empty JSON line.
///
/// Lines that fail to parse or validate come back as `MalformedDocument`
/// errors in place; I/O failures end the stream with a single `Io` error.
pub fn read_documents_jsonl<R: BufRead>(reader: R) -> impl Iterator<Item = Result<Document>> {
    let mut failed = false;
    reader
        .lines()
        .enumerate()
        .map_while(move |(idx, line)| {
            if failed {
                return None;
            }
            let line_no = idx + 1;
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    failed = true;
                    return Some(Some(Err(RagError::Io(err))));
                }
            };
            if line.trim().is_empty() {
                return Some(None);
            }
            let parsed = serde_json::from_str::<DocumentRecord>(&line)
                .map_err(|err| RagError::malformed(format!("line {line_no}"), err.to_string()))
                .and_then(|record| Document::from_record(record, line_no));
            Some(Some(parsed))
        })
        .flatten()
}

/// Reads the ETL step's JSON array of publications with processed files.
///
/// Each processed file becomes its own document with id `"{doc_id}/{index}"`;
/// records without usable files surface as `MalformedDocument`.
pub fn read_documents_json(json: &str) -> Result<Vec<Result<Document>>> {
    let records: Vec<ProcessedPublication> = serde_json::from_str(json)?;
    let mut out = Vec::new();
    for (position, publication) in records.into_iter().enumerate() {
        let label = publication
            .id
            .clone()
            .unwrap_or_else(|| format!("record #{}", position + 1));
        if publication.processed_files.is_empty() {
            out.push(Err(RagError::malformed(label, "no processed files")));
            continue;
        }
        for (file_idx, file) in publication.processed_files.into_iter().enumerate() {
            let tables = match file.tables_json.as_deref().map(str::trim) {
                None | Some("") => Vec::new(),
                Some(raw) => match serde_json::from_str::<Vec<Vec<Vec<Option<String>>>>>(raw) {
                    Ok(grids) => grids
                        .into_iter()
                        .map(|rows| DocumentTable {
                            caption: None,
                            rows,
                        })
                        .collect(),
                    Err(err) => {
                        out.push(Err(RagError::malformed(
                            format!("{label}/{file_idx}"),
                            format!("invalid tables_json: {err}"),
                        )));
                        continue;
                    }
                },
            };
            let record = DocumentRecord {
                id: publication.id.as_ref().map(|id| format!("{id}/{file_idx}")),
                source_url: file.url.or_else(|| publication.url.clone()),
                title: publication.title.clone(),
                published_on: publication.date_published.clone(),
                retrieved_at: None,
                raw_text: file.text_content,
                tables,
            };
            out.push(Document::from_record(record, position + 1));
        }
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct ProcessedPublication {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    date_published: Option<String>,
    #[serde(default)]
    processed_files: Vec<ProcessedFile>,
}

#[derive(Debug, Deserialize)]
struct ProcessedFile {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    text_content: Option<String>,
    #[serde(default)]
    tables_json: Option<String>,
}

fn required(value: Option<String>, label: &str, field: &str) -> Result<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(RagError::malformed(label, format!("{field} missing"))),
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.date_naive());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|ts| ts.date())
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
