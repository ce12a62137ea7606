//! CSV/Excel loaders: thin, synchronous adapters invoked only via
//! `load_source_from_path` when `format` is `csv` or `excel`. They build
//! ordinary `RateRecord`s and route them through the same insert-or-merge
//! path the JSON ingester uses, but take no part in streaming, sessions,
//! or the aggregation engine beyond producing those records.

use crate::error::{CoreError, CoreResult};
use crate::model::RateRecord;
use calamine::{open_workbook_auto, Reader};
use std::path::Path;

/// One row's worth of data, already matched against a format's column
/// heuristics.
pub struct LoadedRow {
    pub code: String,
    pub description: String,
    pub rate: RateRecord,
}

const CODE_CANDIDATES: &[&str] = &["cpt", "code", "proc_cd", "procedure", "hcpcs"];
const PRICE_CANDIDATES: &[&str] = &["price", "rate", "amount", "cost", "fee", "allowance", "calc_rate"];
const DESCRIPTION_CANDIDATES: &[&str] = &["desc", "description", "name"];

/// Column indices resolved from a header row via case-insensitive
/// substring matching.
struct ColumnMap {
    code_idx: usize,
    price_idx: usize,
    description_idx: Option<usize>,
}

fn find_column(headers: &[String], candidates: &[&str], exclude_containing: Option<&str>) -> Option<usize> {
    headers.iter().position(|h| {
        let lower = h.to_lowercase();
        if let Some(excl) = exclude_containing {
            if lower.contains(excl) {
                return false;
            }
        }
        candidates.iter().any(|c| lower.contains(c))
    })
}

fn resolve_columns(headers: &[String]) -> CoreResult<ColumnMap> {
    let code_idx = find_column(headers, CODE_CANDIDATES, Some("desc"))
        .ok_or_else(|| CoreError::ParseError("no code column found (expected one of cpt/code/proc_cd/procedure/hcpcs)".to_string()))?;
    let price_idx = find_column(headers, PRICE_CANDIDATES, None)
        .ok_or_else(|| CoreError::ParseError("no price column found (expected one of price/rate/amount/cost/fee/allowance/calc_rate)".to_string()))?;
    let description_idx = find_column(headers, DESCRIPTION_CANDIDATES, None);
    Ok(ColumnMap { code_idx, price_idx, description_idx })
}

fn row_to_loaded(columns: &ColumnMap, row: &[String], negotiated_type: &str, billing_class: &str) -> Option<LoadedRow> {
    let code = row.get(columns.code_idx)?.trim().to_string();
    if code.is_empty() {
        return None;
    }
    let price = row
        .get(columns.price_idx)
        .and_then(|s| s.trim().parse::<f64>().ok())
        .unwrap_or(0.0);
    let description = columns
        .description_idx
        .and_then(|i| row.get(i))
        .cloned()
        .unwrap_or_default();

    Some(LoadedRow {
        code,
        description,
        rate: RateRecord {
            negotiated_rate: price,
            billing_class: billing_class.to_string(),
            billing_code_modifier: vec![],
            service_code: vec![],
            negotiated_type: negotiated_type.to_string(),
            expiration_date: None,
        },
    })
}

/// Load rows from a CSV file. First row is the header; columns are
/// matched by substring against the candidate lists above.
pub fn load_csv(path: &Path) -> CoreResult<Vec<LoadedRow>> {
    let file = std::fs::File::open(path).map_err(|e| CoreError::IoError { path: path.display().to_string(), source: e })?;
    let mut reader = csv::ReaderBuilder::new().flexible(true).trim(csv::Trim::All).from_reader(file);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| CoreError::ParseError(format!("csv header read failed: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();
    let columns = resolve_columns(&headers)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| CoreError::ParseError(format!("csv row read failed: {e}")))?;
        let fields: Vec<String> = record.iter().map(str::to_string).collect();
        if let Some(loaded) = row_to_loaded(&columns, &fields, "csv_import", "csv_import") {
            rows.push(loaded);
        }
    }
    Ok(rows)
}

/// Load rows from the first worksheet whose header row matches the
/// column heuristics; later sheets are not consulted once one succeeds.
pub fn load_excel(path: &Path) -> CoreResult<Vec<LoadedRow>> {
    let mut workbook = open_workbook_auto(path).map_err(|e| CoreError::ParseError(format!("failed to open workbook: {e}")))?;
    let sheet_names = workbook.sheet_names().to_vec();

    for sheet_name in sheet_names {
        let Ok(range) = workbook.worksheet_range(&sheet_name) else {
            continue;
        };
        let mut rows_iter = range.rows();
        let Some(header_row) = rows_iter.next() else {
            continue;
        };
        let headers: Vec<String> = header_row.iter().map(|c| c.to_string()).collect();
        let Ok(columns) = resolve_columns(&headers) else {
            continue;
        };

        let mut rows = Vec::new();
        for row in rows_iter {
            let fields: Vec<String> = row.iter().map(|c| c.to_string()).collect();
            if let Some(loaded) = row_to_loaded(&columns, &fields, "excel_import", "excel_import") {
                rows.push(loaded);
            }
        }
        return Ok(rows);
    }

    Err(CoreError::ParseError("no worksheet had a recognizable header row".to_string()))
}
