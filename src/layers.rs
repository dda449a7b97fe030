// src/layers.rs - Layer classification, exposure times and print progress
use crate::config::{LayerMotion, Settings};

/// Exposure class of a layer. First and burn-in layers cure longer so the
/// print grips the build head near the plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    First,
    BurnIn,
    Model,
}

/// Classification is a pure function of the 1-indexed layer number and the
/// configured burn-in count.
pub fn classify(layer: u32, burn_in_layers: u32) -> LayerType {
    if layer == 1 {
        LayerType::First
    } else if burn_in_layers > 0 && layer >= 2 && layer <= 1 + burn_in_layers {
        LayerType::BurnIn
    } else {
        LayerType::Model
    }
}

/// Per-print overrides staged alongside the slice images. Anything left
/// unset falls back to the machine settings.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PrintOverrides {
    pub layer_thickness_microns: Option<i32>,
    pub first_exposure_sec: Option<f64>,
    pub burn_in_exposure_sec: Option<f64>,
    pub model_exposure_sec: Option<f64>,
    pub burn_in_layers: Option<u32>,
    pub first_separation_rpm: Option<i32>,
    pub burn_in_separation_rpm: Option<i32>,
    pub model_separation_rpm: Option<i32>,
    pub un_jam_on_approach: Option<bool>,
}

/// Tracks where the current print stands and answers every per-layer
/// question the state machine asks.
#[derive(Debug, Default)]
pub struct LayerTracker {
    current: u32,
    total: u32,
    overrides: PrintOverrides,
}

impl LayerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a print of `total` layers. The tracker stays at layer zero
    /// until the head reaches the start position.
    pub fn start(&mut self, total: u32, overrides: PrintOverrides) {
        self.current = 0;
        self.total = total;
        self.overrides = overrides;
    }

    /// Abandon the print entirely: no layers loaded, nothing in progress.
    pub fn cancel(&mut self) {
        self.current = 0;
        self.total = 0;
        self.overrides = PrintOverrides::default();
    }

    /// The head is at the start position; layer 1 is next.
    pub fn begin_first_layer(&mut self) {
        if self.total > 0 {
            self.current = 1;
        }
    }

    /// Move to the next layer. Returns false when the finished layer was
    /// the last one.
    pub fn advance(&mut self) -> bool {
        if self.current < self.total {
            self.current += 1;
            true
        } else {
            false
        }
    }

    /// Print completed: back to no-layer-in-progress, data still loaded.
    pub fn finish(&mut self) {
        self.current = 0;
    }

    pub fn current_layer(&self) -> u32 {
        self.current
    }

    pub fn num_layers(&self) -> u32 {
        self.total
    }

    pub fn overrides(&self) -> &PrintOverrides {
        &self.overrides
    }

    pub fn burn_in_layers(&self, settings: &Settings) -> u32 {
        self.overrides
            .burn_in_layers
            .unwrap_or(settings.exposure.burn_in_layers)
    }

    pub fn layer_type(&self, settings: &Settings) -> LayerType {
        classify(self.current.max(1), self.burn_in_layers(settings))
    }

    pub fn layer_thickness_microns(&self, settings: &Settings) -> i32 {
        self.overrides
            .layer_thickness_microns
            .unwrap_or(settings.exposure.layer_thickness_microns)
    }

    /// Full exposure for a layer class, before the video-frame correction.
    pub fn exposure_sec(&self, kind: LayerType, settings: &Settings) -> f64 {
        match kind {
            LayerType::First => self
                .overrides
                .first_exposure_sec
                .unwrap_or(settings.exposure.first_exposure_sec),
            LayerType::BurnIn => self
                .overrides
                .burn_in_exposure_sec
                .unwrap_or(settings.exposure.burn_in_exposure_sec),
            LayerType::Model => self
                .overrides
                .model_exposure_sec
                .unwrap_or(settings.exposure.model_exposure_sec),
        }
    }

    /// Exposure as actually armed: one video frame shorter, never negative.
    pub fn armed_exposure_sec(&self, settings: &Settings) -> f64 {
        let kind = self.layer_type(settings);
        (self.exposure_sec(kind, settings) - settings.exposure.videoframe_sec).max(0.0)
    }

    /// Motion parameters for the current layer class, with per-print RPM
    /// overrides applied.
    pub fn motion(&self, settings: &Settings) -> LayerMotion {
        let kind = self.layer_type(settings);
        let (base, rpm) = match kind {
            LayerType::First => (&settings.motion.first, self.overrides.first_separation_rpm),
            LayerType::BurnIn => (
                &settings.motion.burn_in,
                self.overrides.burn_in_separation_rpm,
            ),
            LayerType::Model => (&settings.motion.model, self.overrides.model_separation_rpm),
        };
        let mut motion = base.clone();
        if let Some(rpm) = rpm {
            motion.separation_rpm = rpm;
        }
        motion
    }

    /// Sum of the exposures still ahead plus per-layer mechanical overhead.
    pub fn estimated_seconds_remaining(&self, settings: &Settings) -> u32 {
        if self.total == 0 || self.current > self.total {
            return 0;
        }
        let burn_in = self.burn_in_layers(settings);
        let from = self.current.max(1);
        let mut secs = 0.0;
        for layer in from..=self.total {
            secs += self.exposure_sec(classify(layer, burn_in), settings);
            secs += settings.exposure.layer_overhead_sec;
        }
        secs.ceil() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_oracle() {
        // Oracle straight from the definition
        fn oracle(layer: u32, b: u32) -> LayerType {
            if layer == 1 {
                LayerType::First
            } else if b > 0 && (2..=1 + b).contains(&layer) {
                LayerType::BurnIn
            } else {
                LayerType::Model
            }
        }
        for b in 0..5 {
            for layer in 1..20 {
                assert_eq!(classify(layer, b), oracle(layer, b), "layer {layer} b {b}");
            }
        }
        assert_eq!(classify(1, 0), LayerType::First);
        assert_eq!(classify(2, 0), LayerType::Model);
        assert_eq!(classify(2, 1), LayerType::BurnIn);
        assert_eq!(classify(3, 1), LayerType::Model);
    }

    #[test]
    fn advance_stays_within_bounds() {
        let mut tracker = LayerTracker::new();
        tracker.start(3, PrintOverrides::default());
        assert_eq!(tracker.current_layer(), 0);
        tracker.begin_first_layer();
        for expected in [1, 2, 3] {
            assert_eq!(tracker.current_layer(), expected);
            assert!(tracker.current_layer() >= 1);
            assert!(tracker.current_layer() <= tracker.num_layers());
            if expected < 3 {
                assert!(tracker.advance());
            }
        }
        assert!(!tracker.advance());
        tracker.finish();
        assert_eq!(tracker.current_layer(), 0);
        assert_eq!(tracker.num_layers(), 3);
    }

    #[test]
    fn cancel_clears_everything() {
        let mut tracker = LayerTracker::new();
        tracker.start(5, PrintOverrides::default());
        tracker.begin_first_layer();
        tracker.cancel();
        assert_eq!(tracker.current_layer(), 0);
        assert_eq!(tracker.num_layers(), 0);
    }

    #[test]
    fn exposure_uses_overrides_and_videoframe_clamp() {
        let mut settings = Settings::default();
        settings.exposure.first_exposure_sec = 2.0;
        settings.exposure.videoframe_sec = 0.05;
        let mut tracker = LayerTracker::new();
        tracker.start(
            3,
            PrintOverrides {
                model_exposure_sec: Some(0.01),
                ..Default::default()
            },
        );
        tracker.begin_first_layer();
        assert!((tracker.armed_exposure_sec(&settings) - 1.95).abs() < 1e-9);

        // Layer 3 is a model layer with an override shorter than one frame
        tracker.advance();
        tracker.advance();
        assert_eq!(tracker.layer_type(&settings), LayerType::Model);
        assert_eq!(tracker.armed_exposure_sec(&settings), 0.0);
    }

    #[test]
    fn estimate_shrinks_as_layers_complete() {
        let mut settings = Settings::default();
        settings.exposure.first_exposure_sec = 2.0;
        settings.exposure.burn_in_exposure_sec = 1.5;
        settings.exposure.model_exposure_sec = 1.0;
        settings.exposure.burn_in_layers = 1;
        settings.exposure.layer_overhead_sec = 6.0;
        let mut tracker = LayerTracker::new();
        tracker.start(3, PrintOverrides::default());
        // 2 + 1.5 + 1 exposure plus 3 * 6 overhead
        assert_eq!(tracker.estimated_seconds_remaining(&settings), 23);
        tracker.begin_first_layer();
        tracker.advance();
        // burn-in + model left
        assert_eq!(tracker.estimated_seconds_remaining(&settings), 15);
        tracker.cancel();
        assert_eq!(tracker.estimated_seconds_remaining(&settings), 0);
    }

    #[test]
    fn rpm_override_applies_to_matching_class_only() {
        let settings = Settings::default();
        let mut tracker = LayerTracker::new();
        tracker.start(
            4,
            PrintOverrides {
                burn_in_separation_rpm: Some(9),
                ..Default::default()
            },
        );
        tracker.begin_first_layer();
        assert_eq!(
            tracker.motion(&settings).separation_rpm,
            settings.motion.first.separation_rpm
        );
        tracker.advance();
        assert_eq!(tracker.motion(&settings).separation_rpm, 9);
    }
}
