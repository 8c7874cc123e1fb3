use std::path::Path;

use calamine::{open_workbook_auto, DataRef, Reader, Sheets};
use csv_async::StringRecord;
use tokio::sync::mpsc;
use tracing::debug;

use super::{RowMapper, Window};
use crate::error::ReadError;
use crate::record::NormalizedRecord;

/// Collects mapped rows into windows and hands each one to the consumer.
struct WindowSink<'a> {
    tx: &'a mpsc::Sender<Window>,
    window_rows: usize,
    skip_rows: usize,
    mapper: Option<RowMapper>,
    data_rows_seen: usize,
    buffered_rows: usize,
    records: Vec<NormalizedRecord>,
}

impl<'a> WindowSink<'a> {
    fn new(tx: &'a mpsc::Sender<Window>, skip_rows: usize, window_rows: usize) -> Self {
        WindowSink {
            tx,
            window_rows,
            skip_rows,
            mapper: None,
            data_rows_seen: 0,
            buffered_rows: 0,
            records: Vec::with_capacity(window_rows),
        }
    }

    /// Feeds one sheet row. The first row is the header. Returns false once the
    /// consumer has gone away.
    fn push(&mut self, cells: Vec<String>) -> bool {
        let row = StringRecord::from(cells);
        if self.mapper.is_none() {
            self.mapper = Some(RowMapper::new(&row));
            return true;
        }

        self.data_rows_seen += 1;
        if self.data_rows_seen <= self.skip_rows {
            return true;
        }

        if let Some(record) = self.mapper.as_ref().and_then(|mapper| mapper.map(&row)) {
            self.records.push(record);
        }
        self.buffered_rows += 1;
        if self.buffered_rows >= self.window_rows {
            return self.flush();
        }
        true
    }

    /// Blank rows never reach `push` when streaming cells, so they are only counted.
    fn skip_blank_rows(&mut self, count: usize) {
        if self.mapper.is_some() {
            self.data_rows_seen += count;
        }
    }

    fn flush(&mut self) -> bool {
        self.buffered_rows = 0;
        let window = std::mem::replace(&mut self.records, Vec::with_capacity(self.window_rows));
        self.tx.blocking_send(Ok(window)).is_ok()
    }

    fn finish(mut self) {
        if !self.records.is_empty() || self.buffered_rows > 0 {
            self.flush();
        }
    }
}

fn cell_text(value: &DataRef<'_>) -> String {
    match value {
        DataRef::String(s) | DataRef::DateTimeIso(s) | DataRef::DurationIso(s) => s.clone(),
        DataRef::SharedString(s) => s.to_string(),
        DataRef::Float(f) => f.to_string(),
        DataRef::Int(i) => i.to_string(),
        DataRef::Bool(b) => b.to_string(),
        DataRef::DateTime(dt) => dt.as_f64().to_string(),
        _ => String::new(),
    }
}

/// Reads the first worksheet of a workbook on a blocking thread.
pub(super) fn produce(
    path: &Path,
    skip_rows: usize,
    window_rows: usize,
    tx: &mpsc::Sender<Window>,
) -> Result<(), ReadError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| ReadError::parse(path, e))?;
    let Some(sheet) = workbook.sheet_names().first().cloned() else {
        return Ok(());
    };
    let mut sink = WindowSink::new(tx, skip_rows, window_rows);

    match &mut workbook {
        Sheets::Xlsx(xlsx) => {
            // stream cells so the sheet is never materialized
            let mut cells = xlsx
                .worksheet_cells_reader(&sheet)
                .map_err(|e| ReadError::parse(path, e))?;
            let mut current_row: Option<u32> = None;
            let mut row: Vec<String> = Vec::new();

            while let Some(cell) = cells.next_cell().map_err(|e| ReadError::parse(path, e))? {
                let (row_index, col_index) = cell.get_position();
                if current_row != Some(row_index) {
                    if let Some(previous) = current_row {
                        if !sink.push(std::mem::take(&mut row)) {
                            debug!(?path, "Reader dropped, stopping");
                            return Ok(());
                        }
                        sink.skip_blank_rows(row_index.saturating_sub(previous + 1) as usize);
                    }
                    current_row = Some(row_index);
                }
                let col_index = col_index as usize;
                if row.len() <= col_index {
                    row.resize(col_index + 1, String::new());
                }
                row[col_index] = cell_text(cell.get_value());
            }
            if current_row.is_some() && !sink.push(row) {
                return Ok(());
            }
        }
        other => {
            let range = other
                .worksheet_range(&sheet)
                .map_err(|e| ReadError::parse(path, e))?;
            for cells in range.rows() {
                let cells = cells.iter().map(|cell| cell.to_string()).collect();
                if !sink.push(cells) {
                    debug!(?path, "Reader dropped, stopping");
                    return Ok(());
                }
            }
        }
    }

    sink.finish();
    Ok(())
}
