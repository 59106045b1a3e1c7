use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::time::{Duration, Instant};

use super::effects::{EffectRuntime, Targets};
use super::error::StageError;
use super::manager::StageManager;
use super::model::clamp_channel;

const FRAME_INTERVAL: Duration = Duration::from_nanos(33_333_333); // 30 Hz

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Easing {
    #[serde(rename = "linear")]
    Linear,
    #[serde(rename = "ease-in")]
    EaseIn,
    #[serde(rename = "ease-out")]
    EaseOut,
    #[serde(rename = "ease-in-out")]
    EaseInOut,
}

impl Easing {
    pub fn apply(self, t: f64) -> f64 {
        match self {
            Easing::Linear => t,
            Easing::EaseIn => t * t,
            Easing::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
            Easing::EaseInOut => 3.0 * t * t - 2.0 * t * t * t,
        }
    }
}

impl Default for Easing {
    fn default() -> Self {
        Easing::Linear
    }
}

/// Strip-mode pattern parameters; every field has the catalog default so a
/// keyframe only names what it changes.
#[derive(Debug, Clone, Deserialize)]
pub struct StripPattern {
    #[serde(default = "d_wavelength")]
    pub wavelength: f64,
    #[serde(default = "d_amplitude")]
    pub amplitude: f64,
    #[serde(default = "d_white")]
    pub color: [i64; 3],
    #[serde(default = "d_red")]
    pub start_color: [i64; 3],
    #[serde(default = "d_blue")]
    pub end_color: [i64; 3],
    #[serde(default = "d_width")]
    pub width: f64,
}

impl Default for StripPattern {
    fn default() -> Self {
        StripPattern {
            wavelength: d_wavelength(),
            amplitude: d_amplitude(),
            color: d_white(),
            start_color: d_red(),
            end_color: d_blue(),
            width: d_width(),
        }
    }
}

fn d_wavelength() -> f64 {
    10.0
}

fn d_amplitude() -> f64 {
    255.0
}

fn d_white() -> [i64; 3] {
    [255, 255, 255]
}

fn d_red() -> [i64; 3] {
    [255, 0, 0]
}

fn d_blue() -> [i64; 3] {
    [0, 0, 255]
}

fn d_width() -> f64 {
    3.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct Keyframe {
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub values: HashMap<String, Vec<i64>>,
    #[serde(default = "d_pattern_type")]
    pub pattern_type: String,
    #[serde(default)]
    pub pattern: StripPattern,
    #[serde(default)]
    pub easing: Easing,
}

fn d_pattern_type() -> String {
    String::from("solid")
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CustomMode {
    Spot,
    Strip,
}

#[derive(Debug, Deserialize)]
struct CustomParams {
    #[serde(default)]
    keyframes: Vec<Keyframe>,
    #[serde(default = "d_duration")]
    duration: f64,
    #[serde(default = "d_mode")]
    mode: CustomMode,
}

fn d_duration() -> f64 {
    10.0
}

fn d_mode() -> CustomMode {
    CustomMode::Spot
}

/// Keyframe-driven effect: loops over `duration`, maps the elapsed time to
/// a position in [0,100], interpolates between the bracketing keyframes
/// with the next keyframe's easing, and renders either a uniform color per
/// device (spot) or per-pixel patterns on RGB strips.
#[derive(Debug)]
pub struct CustomEffect {
    targets: Targets,
    keyframes: Vec<Keyframe>,
    duration: f64,
    mode: CustomMode,
    start: Instant,
}

impl CustomEffect {
    pub fn build(params: &Value, targets: Targets, now: Instant) -> Result<CustomEffect, StageError> {
        let params: CustomParams = serde_json::from_value(params.clone())
            .map_err(|e| StageError::InvalidEffectParams("custom", e))?;

        if params.keyframes.len() < 2 {
            return Err(StageError::NotEnoughKeyframes);
        }
        if !(params.duration > 0.0) {
            return Err(StageError::Validation(String::from(
                "Custom effect duration must be positive",
            )));
        }

        let mut keyframes = params.keyframes;
        keyframes.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));

        Ok(CustomEffect {
            targets,
            keyframes,
            duration: params.duration,
            mode: params.mode,
            start: now,
        })
    }

    fn bracket(&self, position: f64) -> (&Keyframe, &Keyframe) {
        let mut prev = &self.keyframes[0];
        let mut next = &self.keyframes[self.keyframes.len() - 1];

        for pair in self.keyframes.windows(2) {
            if pair[0].time <= position && position <= pair[1].time {
                prev = &pair[0];
                next = &pair[1];
                break;
            }
        }

        (prev, next)
    }
}

impl EffectRuntime for CustomEffect {
    fn tick(&mut self, stage: &mut StageManager, now: Instant) -> Result<Duration, StageError> {
        let elapsed = now.duration_since(self.start).as_secs_f64();
        let position = (elapsed % self.duration) / self.duration * 100.0;

        let (prev, next) = self.bracket(position);

        let span = next.time - prev.time;
        let factor = if span.abs() < f64::EPSILON {
            0.0
        } else {
            (position - prev.time) / span
        };
        let factor = next.easing.apply(factor);

        let resolved = self.targets.resolve(stage);
        match self.mode {
            CustomMode::Spot => apply_spot(stage, &resolved, prev, next, factor),
            CustomMode::Strip => apply_strip(stage, &resolved, prev, next, factor),
        }

        Ok(FRAME_INTERVAL)
    }
}

fn spot_values(values: &HashMap<String, Vec<i64>>, device_id: &str) -> Vec<i64> {
    values
        .get(device_id)
        .or_else(|| values.get("default"))
        .cloned()
        .unwrap_or_else(|| vec![255, 255, 255])
}

fn apply_spot(
    stage: &mut StageManager,
    resolved: &[usize],
    prev: &Keyframe,
    next: &Keyframe,
    factor: f64,
) {
    for &idx in resolved {
        let device_id = stage.device_at(idx).id.clone();
        let prev_rgb = spot_values(&prev.values, &device_id);
        let next_rgb = spot_values(&next.values, &device_id);

        let interpolated: Vec<u8> = prev_rgb
            .iter()
            .zip(next_rgb.iter())
            .map(|(p, n)| clamp_channel((*p as f64 + (*n as f64 - *p as f64) * factor) as i64))
            .collect();

        stage.write_device(idx, |d| {
            for (i, value) in interpolated.iter().enumerate().take(d.values.len()) {
                d.values[i] = *value;
            }
        });
    }
}

fn apply_strip(
    stage: &mut StageManager,
    resolved: &[usize],
    prev: &Keyframe,
    next: &Keyframe,
    factor: f64,
) {
    const CHANNELS_PER_PIXEL: usize = 3;

    for &idx in resolved {
        stage.write_device(idx, |d| {
            let num_channels = d.values.len();
            let num_pixels = num_channels / CHANNELS_PER_PIXEL;

            match next.pattern_type.as_str() {
                "wave" => {
                    let wavelength = next.pattern.wavelength;
                    let offset = factor * wavelength;

                    for pixel in 0..num_pixels {
                        let wave =
                            (((pixel as f64 + offset) * 2.0 * PI / wavelength).sin() + 1.0) / 2.0;
                        let brightness = wave * (next.pattern.amplitude / 255.0);

                        for c in 0..CHANNELS_PER_PIXEL {
                            let channel = pixel * CHANNELS_PER_PIXEL + c;
                            d.values[channel] =
                                clamp_channel((next.pattern.color[c] as f64 * brightness) as i64);
                        }
                    }
                }
                "gradient" => {
                    // Spatial gradient across the strip; the temporal factor
                    // is not applied here.
                    let start = next.pattern.start_color;
                    let end = next.pattern.end_color;

                    for pixel in 0..num_pixels {
                        let pixel_factor = pixel as f64 / (num_pixels.saturating_sub(1)).max(1) as f64;

                        for c in 0..CHANNELS_PER_PIXEL {
                            let channel = pixel * CHANNELS_PER_PIXEL + c;
                            let value =
                                start[c] as f64 + (end[c] as f64 - start[c] as f64) * pixel_factor;
                            d.values[channel] = clamp_channel(value as i64);
                        }
                    }
                }
                "chase" => {
                    let width = next.pattern.width;
                    let position = factor * num_pixels as f64;

                    for pixel in 0..num_pixels {
                        let distance = (pixel as f64 - position).abs();

                        for c in 0..CHANNELS_PER_PIXEL {
                            let channel = pixel * CHANNELS_PER_PIXEL + c;
                            d.values[channel] = if distance < width {
                                let brightness = 1.0 - distance / width;
                                clamp_channel((next.pattern.color[c] as f64 * brightness) as i64)
                            } else {
                                0
                            };
                        }
                    }
                }
                _ => {
                    // solid: uniform color interpolation tiled over the strip
                    let mut interpolated = [0u8; CHANNELS_PER_PIXEL];
                    for c in 0..CHANNELS_PER_PIXEL {
                        let value = prev.pattern.color[c] as f64
                            + (next.pattern.color[c] as f64 - prev.pattern.color[c] as f64) * factor;
                        interpolated[c] = clamp_channel(value as i64);
                    }

                    for i in 0..num_channels {
                        d.values[i] = interpolated[i % CHANNELS_PER_PIXEL];
                    }
                }
            }
        });
    }
}
