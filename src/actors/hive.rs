use actix::prelude::*;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::actors::artifact::ArtifactActor;
use crate::detection::{Analysis, HivePipeline};
use crate::error::HivewatchError;
use crate::messages::{FrameOutcome, GetHiveStats, HiveStats, ProcessFrame, WriteArtifacts};
use crate::store::{DetectionResult, ResultStore, UpsertOutcome};

/// Owns one hive's pipeline. Frames are handled atomically: the next frame
/// for the hive is not looked at until the previous one is persisted and
/// folded into the background history.
pub struct HiveActor {
    hive_id: String,
    pipeline: HivePipeline,
    store: Arc<dyn ResultStore>,
    store_images: bool,
    artifacts: Option<Addr<ArtifactActor>>,
    stats: HiveStats,
}

impl HiveActor {
    pub fn new(pipeline: HivePipeline, store: Arc<dyn ResultStore>, store_images: bool) -> Self {
        let hive_id = pipeline.mask().hive_id().to_string();
        Self {
            stats: HiveStats {
                hive_id: hive_id.clone(),
                ..HiveStats::default()
            },
            hive_id,
            pipeline,
            store,
            store_images,
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: Option<Addr<ArtifactActor>>) -> Self {
        self.artifacts = artifacts;
        self
    }

    fn fail(&mut self, filename: &str, err: HivewatchError) -> HivewatchError {
        self.stats.failures += 1;
        warn!(
            target: "hive",
            hive_id = %self.hive_id,
            filename,
            kind = ?err.kind(),
            "Frame failed: {}",
            err
        );
        err
    }
}

impl Actor for HiveActor {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!(target: "hive", hive_id = %self.hive_id, "HiveActor started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(target: "hive", hive_id = %self.hive_id, "HiveActor stopped");
    }
}

impl Handler<ProcessFrame> for HiveActor {
    type Result = AtomicResponse<Self, Result<FrameOutcome, HivewatchError>>;

    fn handle(&mut self, msg: ProcessFrame, _ctx: &mut Self::Context) -> Self::Result {
        let frame = msg.frame;
        self.stats.processed += 1;

        if frame.hive_id != self.hive_id {
            let err = HivewatchError::Other(format!(
                "frame for hive {} routed to hive {}",
                frame.hive_id, self.hive_id
            ));
            return AtomicResponse::new(Box::pin(actix::fut::ready(Err(err))));
        }

        let analysis = HivePipeline::decode_frame(&frame.image)
            .and_then(|decoded| self.pipeline.analyze(&decoded));
        let analysis = match analysis {
            Ok(analysis) => analysis,
            Err(err) => {
                let err = self.fail(&frame.filename, err);
                return AtomicResponse::new(Box::pin(actix::fut::ready(Err(err))));
            }
        };

        let (detection, masked, background) = match analysis {
            Analysis::Warming { masked } => {
                let result = self.pipeline.commit(masked).map(|_| {
                    self.stats.warming += 1;
                    self.stats.history = self.pipeline.history_len();
                    FrameOutcome::Warming {
                        history: self.pipeline.history_len(),
                    }
                });
                debug!(
                    target: "hive",
                    hive_id = %self.hive_id,
                    filename = %frame.filename,
                    history = self.pipeline.history_len(),
                    "Background warming up"
                );
                return AtomicResponse::new(Box::pin(actix::fut::ready(result)));
            }
            Analysis::Detected {
                detection,
                masked,
                background,
            } => (detection, masked, background),
        };

        let result = DetectionResult {
            hive_id: frame.hive_id.clone(),
            filename: frame.filename.clone(),
            timestamp: frame.captured_at,
            coverage: detection.coverage,
            blob_count: detection.blob_count,
        };
        let image = self.store_images.then_some(frame.image);
        let store = self.store.clone();
        let filename = frame.filename;

        AtomicResponse::new(Box::pin(
            async move { store.upsert(result, image).await }
                .into_actor(self)
                .map(move |stored, actor, _ctx| match stored {
                    Ok(UpsertOutcome::Inserted { id }) => {
                        if let Some(artifacts) = &actor.artifacts {
                            artifacts.do_send(WriteArtifacts {
                                hive_id: actor.hive_id.clone(),
                                filename: filename.clone(),
                                mask: actor.pipeline.mask().clone(),
                                masked: masked.clone(),
                                background,
                                foreground: detection.foreground,
                            });
                        }
                        if let Err(err) = actor.pipeline.commit(masked) {
                            error!(
                                target: "hive",
                                hive_id = %actor.hive_id,
                                "Could not update background history: {}",
                                err
                            );
                        }

                        actor.stats.stored += 1;
                        actor.stats.history = actor.pipeline.history_len();
                        actor.stats.last_coverage = Some(detection.coverage);
                        info!(
                            target: "hive",
                            hive_id = %actor.hive_id,
                            filename = %filename,
                            coverage = %detection.coverage,
                            blobs = ?detection.blob_count,
                            id,
                            "Stored detection"
                        );
                        Ok(FrameOutcome::Stored {
                            id,
                            coverage: detection.coverage,
                        })
                    }
                    Ok(UpsertOutcome::Duplicate { id }) => {
                        actor.stats.duplicates += 1;
                        debug!(
                            target: "hive",
                            hive_id = %actor.hive_id,
                            filename = %filename,
                            id,
                            "Frame already stored"
                        );
                        Ok(FrameOutcome::Duplicate { id })
                    }
                    Err(err) => Err(actor.fail(&filename, err)),
                }),
        ))
    }
}

impl Handler<GetHiveStats> for HiveActor {
    type Result = HiveStats;

    fn handle(&mut self, _msg: GetHiveStats, _ctx: &mut Self::Context) -> Self::Result {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cadence, Threshold};
    use crate::consumer::envelope::FrameMessage;
    use crate::detection::{BackgroundModel, Detector, Point, PolygonMask};
    use crate::store::{DetectionQuery, SqliteResultStore};
    use crate::utils::image_utils::encode_png;
    use chrono::Utc;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    fn frame(filename: &str, image: &RgbImage) -> FrameMessage {
        FrameMessage {
            hive_id: "hive-1".to_string(),
            filename: filename.to_string(),
            image: encode_png(image).unwrap(),
            captured_at: Utc::now(),
        }
    }

    fn actor(store: Arc<dyn ResultStore>) -> Addr<HiveActor> {
        let mask = PolygonMask::from_points(
            "hive-1",
            vec![
                Point::new(0, 0),
                Point::new(20, 0),
                Point::new(20, 20),
                Point::new(0, 20),
            ],
        )
        .unwrap();
        let pipeline = HivePipeline::new(
            Arc::new(mask),
            BackgroundModel::new(2, 2, Cadence::EveryFrame),
            Detector::new(Threshold::Fixed { level: 25 }, 3, true),
        );
        HiveActor::new(pipeline, store, true).start()
    }

    #[actix::test]
    async fn test_warmup_then_store() {
        let store: Arc<dyn ResultStore> =
            Arc::new(SqliteResultStore::open_in_memory(Duration::from_secs(5)).unwrap());
        let hive = actor(store.clone());
        let empty = RgbImage::from_pixel(20, 20, Rgb([100, 100, 100]));

        for (i, expected) in [1usize, 2].into_iter().enumerate() {
            let outcome = hive
                .send(ProcessFrame {
                    frame: frame(&format!("warm-{}.png", i), &empty),
                })
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome, FrameOutcome::Warming { history: expected });
        }

        let outcome = hive
            .send(ProcessFrame {
                frame: frame("frame.png", &empty),
            })
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, FrameOutcome::Stored { .. }));

        let records = store.list(&DetectionQuery::for_hive("hive-1")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].coverage.percent(), 0.0);
        assert!(store.get_image(records[0].id).await.unwrap().is_some());
    }

    #[actix::test]
    async fn test_duplicate_does_not_touch_history() {
        let store: Arc<dyn ResultStore> =
            Arc::new(SqliteResultStore::open_in_memory(Duration::from_secs(5)).unwrap());
        let hive = actor(store.clone());
        let empty = RgbImage::from_pixel(20, 20, Rgb([100, 100, 100]));

        for name in ["a.png", "b.png", "c.png"] {
            hive.send(ProcessFrame {
                frame: frame(name, &empty),
            })
            .await
            .unwrap()
            .unwrap();
        }
        let before = hive.send(GetHiveStats).await.unwrap();

        let outcome = hive
            .send(ProcessFrame {
                frame: frame("c.png", &empty),
            })
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, FrameOutcome::Duplicate { .. }));

        let after = hive.send(GetHiveStats).await.unwrap();
        assert_eq!(after.duplicates, 1);
        assert_eq!(after.stored, before.stored);
        assert_eq!(after.history, before.history);
    }

    #[actix::test]
    async fn test_undecodable_frame_is_permanent() {
        let store: Arc<dyn ResultStore> =
            Arc::new(SqliteResultStore::open_in_memory(Duration::from_secs(5)).unwrap());
        let hive = actor(store);

        let mut bad = frame("bad.png", &RgbImage::new(20, 20));
        bad.image = b"garbage".to_vec();
        let err = hive
            .send(ProcessFrame { frame: bad })
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PermanentInput);

        let stats = hive.send(GetHiveStats).await.unwrap();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.history, 0);
    }
}
