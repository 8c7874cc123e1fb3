use std::path::{Path, PathBuf};

use futures::Stream;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::error::ReadError;
use crate::record::NormalizedRecord;

mod columns;
mod delimited;
mod workbook;

pub use columns::{is_truthy, RowMapper};

pub const DEFAULT_WINDOW_ROWS: usize = 2000;

type Window = Result<Vec<NormalizedRecord>, ReadError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    Workbook,
    Delimited { delimiter: u8, gzip: bool },
}

impl TabularFormat {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        let (name, gzip) = match name.strip_suffix(".gz") {
            Some(inner) => (inner.to_string(), true),
            None => (name, false),
        };
        let extension = name.rsplit_once('.')?.1;
        match (extension, gzip) {
            ("xlsx" | "xlsm" | "xlsb" | "xls" | "ods", false) => Some(TabularFormat::Workbook),
            ("csv", _) => Some(TabularFormat::Delimited {
                delimiter: b',',
                gzip,
            }),
            ("tsv", _) => Some(TabularFormat::Delimited {
                delimiter: b'\t',
                gzip,
            }),
            _ => None,
        }
    }
}

/// Streams spreadsheet files as windows of normalized records.
#[derive(Debug, Clone)]
pub struct TabularReader {
    window_rows: usize,
}

impl Default for TabularReader {
    fn default() -> Self {
        TabularReader::new(DEFAULT_WINDOW_ROWS)
    }
}

impl TabularReader {
    pub fn new(window_rows: usize) -> Self {
        TabularReader {
            window_rows: window_rows.max(1),
        }
    }

    pub async fn open(&self, path: &Path) -> Result<RecordWindows, ReadError> {
        self.open_at(path, 0).await
    }

    /// Opens `path`, skipping the first `skip_rows` data rows after the header.
    pub async fn open_at(&self, path: &Path, skip_rows: usize) -> Result<RecordWindows, ReadError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(ReadError::NotFound(path.to_path_buf())),
        }
        let format = TabularFormat::detect(path)
            .ok_or_else(|| ReadError::UnsupportedFormat(path.to_path_buf()))?;

        // capacity 1: the producer holds at most one window beyond the one being consumed
        let (tx, rx) = mpsc::channel::<Window>(1);
        let path: PathBuf = path.to_path_buf();
        let window_rows = self.window_rows;

        debug!(?path, ?format, skip_rows, "Opening tabular file");
        let task = match format {
            TabularFormat::Workbook => tokio::task::spawn_blocking(move || {
                if let Err(e) = workbook::produce(&path, skip_rows, window_rows, &tx) {
                    let _ = tx.blocking_send(Err(e));
                }
            }),
            TabularFormat::Delimited { delimiter, gzip } => tokio::spawn(async move {
                let result =
                    delimited::produce(&path, delimiter, gzip, skip_rows, window_rows, &tx).await;
                if let Err(e) = result {
                    let _ = tx.send(Err(e)).await;
                }
            }),
        };

        Ok(RecordWindows {
            rx,
            task: Some(task),
        })
    }

    /// Reads every record of `path` in file order.
    pub async fn read_all(&self, path: &Path) -> Result<Vec<NormalizedRecord>, ReadError> {
        let start = std::time::Instant::now();
        let mut windows = self.open(path).await?;
        let mut records = Vec::new();
        while let Some(window) = windows.next_window().await {
            records.extend(window?);
        }
        info!(
            ?path,
            records = records.len(),
            "Read file in {:?}",
            start.elapsed()
        );
        Ok(records)
    }
}

/// Lazily produced windows of records. Dropping it stops the producer.
pub struct RecordWindows {
    rx: mpsc::Receiver<Window>,
    task: Option<JoinHandle<()>>,
}

impl RecordWindows {
    pub async fn next_window(&mut self) -> Option<Window> {
        match self.rx.recv().await {
            Some(window) => Some(window),
            None => {
                // channel closed: surface a producer panic instead of a silent end
                match self.task.take()?.await {
                    Err(e) if e.is_panic() => Some(Err(ReadError::Task(e.to_string()))),
                    _ => None,
                }
            }
        }
    }

    /// Flattens the windows into a stream of records.
    pub fn into_stream(self) -> impl Stream<Item = Result<NormalizedRecord, ReadError>> {
        futures::stream::unfold(
            (self, Vec::new().into_iter()),
            |(mut windows, mut current)| async move {
                loop {
                    if let Some(record) = current.next() {
                        return Some((Ok(record), (windows, current)));
                    }
                    match windows.next_window().await? {
                        Ok(window) => current = window.into_iter(),
                        Err(e) => return Some((Err(e), (windows, Vec::new().into_iter()))),
                    }
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::io::Write;

    fn write_csv(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    fn rows(count: usize) -> String {
        let mut body = String::from("SKU,Name,Regular price\n");
        for i in 0..count {
            body.push_str(&format!("SKU-{i},Product {i},{i}.50\n"));
        }
        body
    }

    #[test]
    fn detects_formats_by_extension() {
        assert_eq!(
            TabularFormat::detect(Path::new("a/Products.XLSX")),
            Some(TabularFormat::Workbook)
        );
        assert_eq!(
            TabularFormat::detect(Path::new("dump.tsv.gz")),
            Some(TabularFormat::Delimited {
                delimiter: b'\t',
                gzip: true
            })
        );
        assert_eq!(TabularFormat::detect(Path::new("notes.txt")), None);
        assert_eq!(TabularFormat::detect(Path::new("archive.xlsx.gz")), None);
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let reader = TabularReader::default();
        let err = reader
            .read_all(Path::new("/definitely/not/here.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::NotFound(_)));
    }

    #[tokio::test]
    async fn unsupported_extension_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "products.txt", "SKU\nA\n");
        let err = TabularReader::default().open(&path).await.err().unwrap();
        assert!(matches!(err, ReadError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn windows_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "products.csv", &rows(25));
        let mut windows = TabularReader::new(10).open(&path).await.unwrap();

        let mut sizes = Vec::new();
        while let Some(window) = windows.next_window().await {
            sizes.push(window.unwrap().len());
        }
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn skips_empty_rows_and_restarts_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let body = "SKU,Name\nA,First\n,\n  ,  \nB,Second\nC,Third\n";
        let path = write_csv(dir.path(), "products.csv", body);
        let reader = TabularReader::new(2);

        let all = reader.read_all(&path).await.unwrap();
        let skus: Vec<&str> = all.iter().map(|r| r.sku_label()).collect();
        assert_eq!(skus, vec!["A", "B", "C"]);

        // offset counts raw data rows, blank ones included
        let rest: Vec<NormalizedRecord> = reader
            .open_at(&path, 3)
            .await
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        let skus: Vec<&str> = rest.iter().map(|r| r.sku_label()).collect();
        assert_eq!(skus, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn blank_boolean_cells_read_as_false() {
        let dir = tempfile::tempdir().unwrap();
        let body = "SKU,Name,Published,Attribute 1 name,Attribute 1 value(s),Attribute 1 global\n\
                    A,Alpha,,Color,Red,\n\
                    B,Beta,1,Color,Blue,yes\n";
        let path = write_csv(dir.path(), "products.csv", body);

        let records = TabularReader::default().read_all(&path).await.unwrap();
        assert!(!records[0].published);
        assert!(!records[0].attributes[0].global);
        assert!(records[1].published);
        assert!(records[1].attributes[0].global);
    }

    #[tokio::test]
    async fn reads_gzip_tsv() {
        use async_compression::tokio::write::GzipEncoder;
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.tsv.gz");
        let file = tokio::fs::File::create(&path).await.unwrap();
        let mut encoder = GzipEncoder::new(file);
        encoder
            .write_all(b"Type\tSKU\tName\tIs featured?\nvariable\tP-1\tParent\tyes\n")
            .await
            .unwrap();
        encoder.shutdown().await.unwrap();

        let records = TabularReader::default().read_all(&path).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, crate::kind::ProductKind::Variable);
        assert!(records[0].featured);
    }

    #[tokio::test]
    async fn reads_xlsx_workbooks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.xlsx");

        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        let headers = ["Type", "SKU", "Name", "Regular price", "Parent"];
        for (col, header) in headers.iter().enumerate() {
            sheet.write_string(0, col as u16, *header).unwrap();
        }
        sheet.write_string(1, 0, "simple").unwrap();
        sheet.write_string(1, 1, "S-1").unwrap();
        sheet.write_string(1, 2, "Mug").unwrap();
        sheet.write_number(1, 3, 12.5).unwrap();
        // row 2 left blank on purpose
        sheet.write_string(3, 0, "variation").unwrap();
        sheet.write_number(3, 1, 1001).unwrap();
        sheet.write_string(3, 4, "P-1").unwrap();
        for row in 4..30u32 {
            sheet.write_string(row, 1, format!("BULK-{row}")).unwrap();
        }
        workbook.save(&path).unwrap();

        let records = TabularReader::new(7).read_all(&path).await.unwrap();
        assert_eq!(records.len(), 28);
        assert_eq!(records[0].sku.as_deref(), Some("S-1"));
        assert_eq!(records[0].regular_price.as_deref(), Some("12.5"));
        assert_eq!(records[1].kind, crate::kind::ProductKind::Variation);
        assert_eq!(records[1].sku.as_deref(), Some("1001"));
        assert_eq!(records[1].parent.as_deref(), Some("P-1"));
        assert_eq!(records[27].sku.as_deref(), Some("BULK-29"));
    }

    #[tokio::test]
    async fn corrupt_workbook_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "broken.xlsx", "this is not a zip archive");
        let err = TabularReader::default().read_all(&path).await.unwrap_err();
        assert!(matches!(err, ReadError::Parse { .. }));
    }
}
