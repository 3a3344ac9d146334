use image::{GrayImage, Luma, Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::config::{self, Cadence};
use crate::error::HivewatchError;

/// Immutable reference image handed to the detector.
#[derive(Debug)]
pub struct BackgroundSnapshot {
    /// Per-pixel, per-channel median of the history.
    pub image: RgbImage,
    /// Per-pixel temporal standard deviation, maximum over channels.
    pub deviation: GrayImage,
    /// Incremented on every recomputation.
    pub generation: u64,
    /// Number of history frames the snapshot was computed from.
    pub frames: usize,
}

/// Bounded history of masked frames for one hive and the reference derived from it.
#[derive(Debug)]
pub struct BackgroundModel {
    history: VecDeque<RgbImage>,
    capacity: usize,
    warmup: usize,
    cadence: Cadence,
    frames_since_refresh: u32,
    last_refresh: Option<Instant>,
    snapshot: Option<Arc<BackgroundSnapshot>>,
    generation: u64,
}

impl BackgroundModel {
    pub fn new(capacity: usize, warmup: usize, cadence: Cadence) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            warmup: warmup.clamp(1, capacity),
            cadence,
            frames_since_refresh: 0,
            last_refresh: None,
            snapshot: None,
            generation: 0,
        }
    }

    pub fn from_config(config: &config::Background) -> Self {
        Self::new(config.history_size, config.warmup_frames, config.cadence)
    }

    /// Current reference, or `None` while warming up.
    pub fn snapshot(&self) -> Option<Arc<BackgroundSnapshot>> {
        self.snapshot.clone()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn is_warm(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn push(&mut self, frame: RgbImage) -> Result<(), HivewatchError> {
        self.push_at(frame, Instant::now())
    }

    /// Append a masked frame, evicting the oldest when full, and refresh the
    /// reference if the cadence says so.
    pub fn push_at(&mut self, frame: RgbImage, now: Instant) -> Result<(), HivewatchError> {
        if let Some(first) = self.history.front() {
            if first.dimensions() != frame.dimensions() {
                return Err(HivewatchError::Configuration(format!(
                    "background frame is {:?}, history holds {:?}",
                    frame.dimensions(),
                    first.dimensions()
                )));
            }
        }

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(frame);
        self.frames_since_refresh = self.frames_since_refresh.saturating_add(1);

        if self.history.len() < self.warmup {
            return Ok(());
        }

        let due = match (self.snapshot.is_some(), self.cadence) {
            (false, _) => true,
            (true, Cadence::EveryFrame) => true,
            (true, Cadence::EveryFrames { frames }) => self.frames_since_refresh >= frames,
            (true, Cadence::Interval { seconds }) => self
                .last_refresh
                .map(|at| now.duration_since(at) >= Duration::from_secs(seconds))
                .unwrap_or(true),
        };

        if due {
            self.refresh(now);
        }
        Ok(())
    }

    fn refresh(&mut self, now: Instant) {
        let (image, deviation) = median_and_deviation(&self.history);
        self.generation += 1;
        self.frames_since_refresh = 0;
        self.last_refresh = Some(now);
        trace!(
            target: "hive",
            generation = self.generation,
            frames = self.history.len(),
            "Background reference recomputed"
        );
        self.snapshot = Some(Arc::new(BackgroundSnapshot {
            image,
            deviation,
            generation: self.generation,
            frames: self.history.len(),
        }));
    }
}

fn median_and_deviation(history: &VecDeque<RgbImage>) -> (RgbImage, GrayImage) {
    let (width, height) = history
        .front()
        .map(|frame| frame.dimensions())
        .unwrap_or((0, 0));
    let count = history.len();
    let mut median = RgbImage::new(width, height);
    let mut deviation = GrayImage::new(width, height);
    let mut samples: Vec<u8> = Vec::with_capacity(count);

    for y in 0..height {
        for x in 0..width {
            let mut out = [0u8; 3];
            let mut spread = 0f64;

            for (channel, value) in out.iter_mut().enumerate() {
                samples.clear();
                samples.extend(history.iter().map(|frame| frame.get_pixel(x, y)[channel]));

                let mean = samples.iter().map(|&v| v as f64).sum::<f64>() / count as f64;
                let variance = samples
                    .iter()
                    .map(|&v| (v as f64 - mean).powi(2))
                    .sum::<f64>()
                    / count as f64;
                spread = spread.max(variance.sqrt());

                samples.sort_unstable();
                *value = if count % 2 == 1 {
                    samples[count / 2]
                } else {
                    ((samples[count / 2 - 1] as u16 + samples[count / 2] as u16) / 2) as u8
                };
            }

            median.put_pixel(x, y, Rgb(out));
            deviation.put_pixel(x, y, Luma([spread.round().min(255.0) as u8]));
        }
    }

    (median, deviation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(value: u8) -> RgbImage {
        RgbImage::from_pixel(4, 4, Rgb([value, value, value]))
    }

    #[test]
    fn test_no_reference_during_warmup() {
        let mut model = BackgroundModel::new(15, 3, Cadence::EveryFrame);
        model.push(flat(10)).unwrap();
        model.push(flat(10)).unwrap();
        assert!(model.snapshot().is_none());

        model.push(flat(10)).unwrap();
        let snapshot = model.snapshot().unwrap();
        assert_eq!(snapshot.frames, 3);
        assert_eq!(*snapshot.image.get_pixel(0, 0), Rgb([10, 10, 10]));
    }

    #[test]
    fn test_median_ignores_outlier() {
        let mut model = BackgroundModel::new(5, 5, Cadence::EveryFrame);
        for value in [100, 100, 250, 100, 100] {
            model.push(flat(value)).unwrap();
        }
        let snapshot = model.snapshot().unwrap();
        assert_eq!(*snapshot.image.get_pixel(2, 2), Rgb([100, 100, 100]));
        assert!(snapshot.deviation.get_pixel(2, 2)[0] > 0);
    }

    #[test]
    fn test_even_history_averages_middle_values() {
        let mut model = BackgroundModel::new(4, 4, Cadence::EveryFrame);
        for value in [10, 20, 31, 40] {
            model.push(flat(value)).unwrap();
        }
        assert_eq!(model.snapshot().unwrap().image.get_pixel(0, 0)[0], 25);
    }

    #[test]
    fn test_oldest_frame_is_evicted() {
        let mut model = BackgroundModel::new(15, 15, Cadence::EveryFrame);
        for i in 0..15u8 {
            model.push(flat(i * 10)).unwrap();
        }
        assert_eq!(model.snapshot().unwrap().image.get_pixel(0, 0)[0], 70);

        model.push(flat(150)).unwrap();
        assert_eq!(model.history_len(), 15);
        let snapshot = model.snapshot().unwrap();
        assert_eq!(snapshot.image.get_pixel(0, 0)[0], 80);
        assert_eq!(snapshot.frames, 15);
    }

    #[test]
    fn test_every_frames_cadence() {
        let mut model = BackgroundModel::new(10, 1, Cadence::EveryFrames { frames: 3 });
        model.push(flat(0)).unwrap();
        assert_eq!(model.snapshot().unwrap().generation, 1);

        model.push(flat(0)).unwrap();
        model.push(flat(0)).unwrap();
        assert_eq!(model.snapshot().unwrap().generation, 1);

        model.push(flat(0)).unwrap();
        assert_eq!(model.snapshot().unwrap().generation, 2);
    }

    #[test]
    fn test_interval_cadence() {
        let start = Instant::now();
        let mut model = BackgroundModel::new(10, 1, Cadence::Interval { seconds: 60 });
        model.push_at(flat(0), start).unwrap();
        model
            .push_at(flat(0), start + Duration::from_secs(30))
            .unwrap();
        assert_eq!(model.snapshot().unwrap().generation, 1);

        model
            .push_at(flat(0), start + Duration::from_secs(61))
            .unwrap();
        assert_eq!(model.snapshot().unwrap().generation, 2);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let mut model = BackgroundModel::new(3, 1, Cadence::EveryFrame);
        model.push(flat(0)).unwrap();
        assert!(model.push(RgbImage::new(2, 2)).is_err());
        assert_eq!(model.history_len(), 1);
    }
}
