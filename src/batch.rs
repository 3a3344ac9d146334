use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::consumer::envelope::sanitize_filename;
use crate::detection::{Analysis, HivePipeline, PolygonMask};
use crate::error::{ErrorKind, HivewatchError};
use crate::store::{Coverage, DetectionQuery, DetectionResult, ResultStore, UpsertOutcome};

const BATCH_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub files: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub warming: usize,
    pub failed: usize,
    pub mean: Option<f64>,
    pub max: Option<Coverage>,
    pub min: Option<Coverage>,
}

impl BatchSummary {
    fn record(&mut self, coverage: Coverage) {
        let measured = (self.stored + self.duplicates) as f64;
        let mean = self.mean.unwrap_or(0.0);
        self.mean = Some(mean + (coverage.percent() - mean) / measured);
        self.max = Some(self.max.map_or(coverage, |m| m.max(coverage)));
        self.min = Some(self.min.map_or(coverage, |m| m.min(coverage)));
    }
}

/// Image files in `dir`, sorted by name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, HivewatchError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| BATCH_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn captured_at(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Run every image in `input` through one hive's pipeline, in filename order.
///
/// Unlike live consumption, duplicates still enter the background history so
/// that re-running a directory rebuilds the same reference.
pub async fn run_batch(
    config: &Config,
    store: Arc<dyn ResultStore>,
    hive_id: &str,
    input: &Path,
) -> Result<BatchSummary, HivewatchError> {
    let mask = PolygonMask::load(&config.masks.dir, hive_id)?;
    let mut pipeline = HivePipeline::from_config(Arc::new(mask), config);
    let mut summary = BatchSummary::default();

    for path in list_images(input)? {
        summary.files += 1;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match process_file(&mut pipeline, store.as_ref(), config, hive_id, &path, &name).await {
            Ok(Some((outcome, coverage))) => {
                match outcome {
                    UpsertOutcome::Inserted { .. } => summary.stored += 1,
                    UpsertOutcome::Duplicate { .. } => summary.duplicates += 1,
                }
                summary.record(coverage);
                info!(target: "hive", hive_id, filename = %name, coverage = %coverage, "Processed");
            }
            Ok(None) => summary.warming += 1,
            Err(err) if err.kind() == ErrorKind::Configuration => return Err(err),
            Err(err) => {
                summary.failed += 1;
                warn!(target: "hive", hive_id, filename = %name, "Skipping file: {}", err);
            }
        }
    }

    Ok(summary)
}

async fn process_file(
    pipeline: &mut HivePipeline,
    store: &dyn ResultStore,
    config: &Config,
    hive_id: &str,
    path: &Path,
    name: &str,
) -> Result<Option<(UpsertOutcome, Coverage)>, HivewatchError> {
    let bytes = tokio::fs::read(path).await?;
    let frame = HivePipeline::decode_frame(&bytes)?;

    match pipeline.analyze(&frame)? {
        Analysis::Warming { masked } => {
            pipeline.commit(masked)?;
            Ok(None)
        }
        Analysis::Detected {
            detection, masked, ..
        } => {
            let result = DetectionResult {
                hive_id: hive_id.to_string(),
                filename: sanitize_filename(name)?,
                timestamp: captured_at(path),
                coverage: detection.coverage,
                blob_count: detection.blob_count,
            };
            let image = config.store.store_images.then_some(bytes);
            let outcome = store.upsert(result, image).await?;
            pipeline.commit(masked)?;
            Ok(Some((outcome, detection.coverage)))
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(|c: char| c == ',' || c == '"' || c == '\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Write `timestamp,hive_id,filename,coverage` rows. Returns the row count.
pub async fn export_csv<W: Write>(
    store: &dyn ResultStore,
    query: &DetectionQuery,
    mut out: W,
) -> Result<usize, HivewatchError> {
    let records = store.list(query).await?;
    writeln!(out, "timestamp,hive_id,filename,coverage")?;
    for record in &records {
        writeln!(
            out,
            "{},{},{},{}",
            record.timestamp.to_rfc3339(),
            csv_field(&record.hive_id),
            csv_field(&record.filename),
            record.coverage
        )?;
    }
    out.flush()?;
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteResultStore;
    use crate::utils::image_utils::encode_png;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    fn config(masks: &Path) -> Config {
        let mut config = Config::from_toml(
            r#"
            [broker]
            brokers = "localhost:9092"
            topic = "frames"

            [background]
            history_size = 3
            warmup_frames = 3
            "#,
        )
        .unwrap();
        config.masks.dir = masks.to_path_buf();
        config.store.store_images = false;
        config
    }

    fn write_frame(dir: &Path, name: &str, bee_block: bool) {
        let mut frame = RgbImage::from_pixel(30, 30, Rgb([90, 110, 90]));
        if bee_block {
            for y in 5..15 {
                for x in 5..15 {
                    frame.put_pixel(x, y, Rgb([20, 15, 5]));
                }
            }
        }
        std::fs::write(dir.join(name), encode_png(&frame).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_batch_processes_directory_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let masks = dir.path().join("masks");
        let input = dir.path().join("input");
        std::fs::create_dir_all(&masks).unwrap();
        std::fs::create_dir_all(&input).unwrap();
        std::fs::write(
            masks.join("hive-1.json"),
            r#"{"points":[{"x":0,"y":0},{"x":20,"y":0},{"x":20,"y":20},{"x":0,"y":20}]}"#,
        )
        .unwrap();
        for name in ["01.png", "02.png", "03.png"] {
            write_frame(&input, name, false);
        }
        write_frame(&input, "04.png", true);
        write_frame(&input, "05.png", false);
        std::fs::write(input.join("06.png"), b"broken").unwrap();
        std::fs::write(input.join("notes.txt"), b"ignored").unwrap();

        let config = config(&masks);
        let store: Arc<dyn ResultStore> =
            Arc::new(SqliteResultStore::open_in_memory(Duration::from_secs(5)).unwrap());

        let summary = run_batch(&config, store.clone(), "hive-1", &input).await.unwrap();
        assert_eq!(summary.files, 6);
        assert_eq!(summary.warming, 3);
        assert_eq!(summary.stored, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.max.unwrap().percent(), 25.0);
        assert_eq!(summary.min.unwrap(), Coverage::ZERO);
        assert_eq!(summary.mean, Some(12.5));

        let rerun = run_batch(&config, store.clone(), "hive-1", &input).await.unwrap();
        assert_eq!(rerun.duplicates, 2);
        assert_eq!(rerun.stored, 0);

        let mut csv = Vec::new();
        let rows = export_csv(store.as_ref(), &DetectionQuery::for_hive("hive-1"), &mut csv)
            .await
            .unwrap();
        assert_eq!(rows, 2);
        let text = String::from_utf8(csv).unwrap();
        assert!(text.starts_with("timestamp,hive_id,filename,coverage\n"));
        assert!(text.contains(",hive-1,04.png,25.000"));
    }

    #[tokio::test]
    async fn test_missing_mask_aborts_batch() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let store: Arc<dyn ResultStore> =
            Arc::new(SqliteResultStore::open_in_memory(Duration::from_secs(5)).unwrap());

        let err = run_batch(&config, store, "hive-9", dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
