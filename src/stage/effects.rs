use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Debug;
use std::time::{Duration, Instant};

use super::error::StageError;
use super::keyframes::CustomEffect;
use super::manager::StageManager;
use super::model::{clamp_channel, FrequencyBand};

/// A running effect, driven as a step function by the stage tick loop.
///
/// Each call writes at most one frame to the current targets and returns
/// how long the effect wants to sleep before its next step. Targets are
/// re-resolved on every call so devices added or removed mid-flight take
/// effect on the next cycle.
pub trait EffectRuntime: Debug + Send {
    fn tick(&mut self, stage: &mut StageManager, now: Instant) -> Result<Duration, StageError>;
}

/// Target list of an effect instance: device ids, or group ids resolved to
/// their member devices.
#[derive(Debug, Clone)]
pub struct Targets {
    pub ids: Vec<String>,
    pub is_group: bool,
}

impl Targets {
    pub(crate) fn resolve(&self, stage: &StageManager) -> Vec<usize> {
        stage.resolve_targets(&self.ids, self.is_group)
    }
}

pub fn build_runtime(
    effect_type: &str,
    params: &Value,
    targets: Targets,
    now: Instant,
) -> Result<Box<dyn EffectRuntime>, StageError> {
    let empty = Value::Object(serde_json::Map::new());
    let params = if params.is_null() { &empty } else { params };

    Ok(match effect_type {
        "strobe" => {
            let p: StrobeParams = parse("strobe", params)?;
            Box::new(Strobe {
                targets,
                speed: p.speed,
                on: true,
            })
        }
        "rainbow" => {
            let p: RainbowParams = parse("rainbow", params)?;
            Box::new(Rainbow {
                targets,
                speed: p.speed,
                hue: 0,
            })
        }
        "chase" => {
            let p: ChaseParams = parse("chase", params)?;
            Box::new(Chase {
                targets,
                speed: p.speed,
                position: 0,
            })
        }
        "pulse" => {
            let p: PulseParams = parse("pulse", params)?;
            Box::new(Pulse {
                targets,
                speed: p.speed,
                brightness: 0,
                rising: true,
            })
        }
        "color_fade" => {
            let p: ColorFadeParams = parse("color_fade", params)?;
            let colors = if p.colors.is_empty() {
                default_fade_colors()
            } else {
                p.colors
            };
            Box::new(ColorFade {
                targets,
                colors,
                speed: p.speed,
                color_idx: 0,
                step: 0,
            })
        }
        "sound_reactive" => {
            let p: SoundReactiveParams = parse("sound_reactive", params)?;
            Box::new(SoundReactive {
                targets,
                mode: p.mode,
                band: p.frequency_band,
                sensitivity: p.sensitivity,
                last_trigger: None,
                flash_on: false,
            })
        }
        "fire" => {
            let p: FireParams = parse("fire", params)?;
            Box::new(Fire {
                targets,
                speed: p.speed,
                intensity: p.intensity,
            })
        }
        "lightning" => {
            let p: LightningParams = parse("lightning", params)?;
            Box::new(Lightning {
                targets,
                min_delay: p.min_delay,
                max_delay: p.max_delay,
                state: LightningState::Idle,
            })
        }
        "scanner" => {
            let p: ScannerParams = parse("scanner", params)?;
            Box::new(Scanner {
                targets,
                speed: p.speed,
                range: p.range.max(1),
                position: 0,
                rising: true,
            })
        }
        "matrix" => {
            let p: MatrixParams = parse("matrix", params)?;
            Box::new(Matrix {
                targets,
                speed: p.speed,
                pattern: p.pattern,
                frame: 0,
            })
        }
        "twinkle" => {
            let p: TwinkleParams = parse("twinkle", params)?;
            Box::new(Twinkle {
                targets,
                speed: p.speed,
                density: p.density.clamp(0.0, 1.0),
            })
        }
        "custom" => Box::new(CustomEffect::build(params, targets, now)?),
        other => return Err(StageError::UnknownEffectType(other.to_string())),
    })
}

fn parse<T: DeserializeOwned>(kind: &'static str, params: &Value) -> Result<T, StageError> {
    serde_json::from_value(params.clone()).map_err(|e| StageError::InvalidEffectParams(kind, e))
}

/// Seconds-as-float parameter to a sleep interval. Out-of-range speeds are
/// clamped; `Duration::from_secs_f64` would panic on them.
fn sleep_secs(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.clamp(0.0, 86_400.0))
}

pub(super) fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (u8, u8, u8) {
    let h = (h % 1.0 + 1.0) % 1.0;
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);

    let (r, g, b) = match (sector as i64) % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };

    (
        (r * 255.0) as u8,
        (g * 255.0) as u8,
        (b * 255.0) as u8,
    )
}

#[derive(Debug, Deserialize)]
struct StrobeParams {
    #[serde(default = "d_strobe_speed")]
    speed: f64,
}

fn d_strobe_speed() -> f64 {
    0.1
}

#[derive(Debug)]
struct Strobe {
    targets: Targets,
    speed: f64,
    on: bool,
}

impl EffectRuntime for Strobe {
    fn tick(&mut self, stage: &mut StageManager, _now: Instant) -> Result<Duration, StageError> {
        let value = if self.on { 255 } else { 0 };
        for idx in self.targets.resolve(stage) {
            stage.fill_device(idx, value);
        }
        self.on = !self.on;
        Ok(sleep_secs(self.speed))
    }
}

#[derive(Debug, Deserialize)]
struct RainbowParams {
    #[serde(default = "d_rainbow_speed")]
    speed: f64,
}

fn d_rainbow_speed() -> f64 {
    0.05
}

#[derive(Debug)]
struct Rainbow {
    targets: Targets,
    speed: f64,
    hue: u16,
}

impl EffectRuntime for Rainbow {
    fn tick(&mut self, stage: &mut StageManager, _now: Instant) -> Result<Duration, StageError> {
        let color = hsv_to_rgb(self.hue as f64 / 360.0, 1.0, 1.0);
        for idx in self.targets.resolve(stage) {
            stage.set_device_color(idx, color);
        }
        self.hue = (self.hue + 1) % 360;
        Ok(sleep_secs(self.speed))
    }
}

#[derive(Debug, Deserialize)]
struct ChaseParams {
    #[serde(default = "d_chase_speed")]
    speed: f64,
}

fn d_chase_speed() -> f64 {
    0.2
}

#[derive(Debug)]
struct Chase {
    targets: Targets,
    speed: f64,
    position: usize,
}

impl EffectRuntime for Chase {
    fn tick(&mut self, stage: &mut StageManager, _now: Instant) -> Result<Duration, StageError> {
        let resolved = self.targets.resolve(stage);
        if resolved.is_empty() {
            return Ok(sleep_secs(self.speed));
        }

        for idx in resolved.iter() {
            stage.fill_device(*idx, 0);
        }

        self.position %= resolved.len();
        stage.fill_device(resolved[self.position], 255);
        self.position = (self.position + 1) % resolved.len();

        Ok(sleep_secs(self.speed))
    }
}

#[derive(Debug, Deserialize)]
struct PulseParams {
    #[serde(default = "d_pulse_speed")]
    speed: f64,
}

fn d_pulse_speed() -> f64 {
    0.02
}

#[derive(Debug)]
struct Pulse {
    targets: Targets,
    speed: f64,
    brightness: i32,
    rising: bool,
}

impl EffectRuntime for Pulse {
    fn tick(&mut self, stage: &mut StageManager, _now: Instant) -> Result<Duration, StageError> {
        for idx in self.targets.resolve(stage) {
            stage.fill_device(idx, self.brightness as u8);
        }

        self.brightness += if self.rising { 5 } else { -5 };
        if self.brightness >= 255 {
            self.brightness = 255;
            self.rising = false;
        } else if self.brightness <= 0 {
            self.brightness = 0;
            self.rising = true;
        }

        Ok(sleep_secs(self.speed))
    }
}

#[derive(Debug, Deserialize)]
struct ColorFadeParams {
    #[serde(default = "default_fade_colors")]
    colors: Vec<[u8; 3]>,
    #[serde(default = "d_color_fade_speed")]
    speed: f64,
}

fn default_fade_colors() -> Vec<[u8; 3]> {
    vec![[255, 0, 0], [0, 255, 0], [0, 0, 255]]
}

fn d_color_fade_speed() -> f64 {
    2.0
}

const COLOR_FADE_STEPS: u32 = 50;

#[derive(Debug)]
struct ColorFade {
    targets: Targets,
    colors: Vec<[u8; 3]>,
    speed: f64,
    color_idx: usize,
    step: u32,
}

impl EffectRuntime for ColorFade {
    fn tick(&mut self, stage: &mut StageManager, _now: Instant) -> Result<Duration, StageError> {
        let start = self.colors[self.color_idx];
        let next = self.colors[(self.color_idx + 1) % self.colors.len()];
        let progress = self.step as f64 / COLOR_FADE_STEPS as f64;

        let color = (
            lerp_channel(start[0], next[0], progress),
            lerp_channel(start[1], next[1], progress),
            lerp_channel(start[2], next[2], progress),
        );

        for idx in self.targets.resolve(stage) {
            stage.set_device_color(idx, color);
        }

        self.step += 1;
        if self.step > COLOR_FADE_STEPS {
            self.step = 0;
            self.color_idx = (self.color_idx + 1) % self.colors.len();
        }

        Ok(sleep_secs(self.speed / COLOR_FADE_STEPS as f64))
    }
}

pub(super) fn lerp_channel(start: u8, end: u8, progress: f64) -> u8 {
    clamp_channel((start as f64 + (end as f64 - start as f64) * progress) as i64)
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SoundMode {
    Intensity,
    Flash,
    Color,
}

#[derive(Debug, Deserialize)]
struct SoundReactiveParams {
    #[serde(default = "d_sound_mode")]
    mode: SoundMode,
    #[serde(default = "d_sound_band")]
    frequency_band: FrequencyBand,
    #[serde(default = "d_sound_sensitivity")]
    sensitivity: f64,
}

fn d_sound_mode() -> SoundMode {
    SoundMode::Intensity
}

fn d_sound_band() -> FrequencyBand {
    FrequencyBand::Overall
}

fn d_sound_sensitivity() -> f64 {
    1.0
}

const SOUND_POLL: Duration = Duration::from_millis(20);
const FLASH_DURATION: Duration = Duration::from_millis(50);
const FLASH_HOLDOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct SoundReactive {
    targets: Targets,
    mode: SoundMode,
    band: FrequencyBand,
    sensitivity: f64,
    last_trigger: Option<Instant>,
    flash_on: bool,
}

impl EffectRuntime for SoundReactive {
    fn tick(&mut self, stage: &mut StageManager, now: Instant) -> Result<Duration, StageError> {
        let level = stage.audio().band(self.band) as f64;
        let adjusted = (level * self.sensitivity).min(1.0);

        match self.mode {
            SoundMode::Flash => {
                if self.flash_on {
                    for idx in self.targets.resolve(stage) {
                        stage.fill_device(idx, 0);
                    }
                    self.flash_on = false;
                    return Ok(SOUND_POLL);
                }

                let threshold = 0.7 / self.sensitivity;
                let armed = self
                    .last_trigger
                    .map_or(true, |t| now.duration_since(t) >= FLASH_HOLDOFF);

                if level > threshold && armed {
                    for idx in self.targets.resolve(stage) {
                        stage.fill_device(idx, 255);
                    }
                    self.last_trigger = Some(now);
                    self.flash_on = true;
                    Ok(FLASH_DURATION)
                } else {
                    Ok(SOUND_POLL)
                }
            }
            SoundMode::Intensity => {
                let brightness = (adjusted * 255.0) as u8;
                for idx in self.targets.resolve(stage) {
                    stage.fill_device(idx, brightness);
                }
                Ok(SOUND_POLL)
            }
            SoundMode::Color => {
                let hue = adjusted * 270.0;
                let color = hsv_to_rgb(hue / 360.0, 1.0, 1.0);
                for idx in self.targets.resolve(stage) {
                    stage.set_device_color(idx, color);
                }
                Ok(SOUND_POLL)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct FireParams {
    #[serde(default = "d_fire_speed")]
    speed: f64,
    #[serde(default = "d_fire_intensity")]
    intensity: f64,
}

fn d_fire_speed() -> f64 {
    0.05
}

fn d_fire_intensity() -> f64 {
    1.0
}

#[derive(Debug)]
struct Fire {
    targets: Targets,
    speed: f64,
    intensity: f64,
}

impl EffectRuntime for Fire {
    fn tick(&mut self, stage: &mut StageManager, _now: Instant) -> Result<Duration, StageError> {
        let mut rng = rand::thread_rng();

        for idx in self.targets.resolve(stage) {
            let base_red = 255.0 * self.intensity;
            let base_green = 100.0 * self.intensity * rng.gen_range(0.3..0.7);
            let flicker = rng.gen_range(0.7..1.0);

            let red = clamp_channel((base_red * flicker) as i64);
            let green = clamp_channel((base_green * flicker) as i64);

            let (is_color, is_dimmer) = {
                let device = stage.device_at(idx);
                (
                    device.is_color(),
                    device.is_dimmer() && !device.values.is_empty(),
                )
            };

            if is_color {
                stage.set_device_color(idx, (red, green, 0));
            } else if is_dimmer {
                stage.write_device(idx, |d| d.values[0] = red);
            }
        }

        Ok(sleep_secs(self.speed))
    }
}

#[derive(Debug, Deserialize)]
struct LightningParams {
    #[serde(default = "d_lightning_min")]
    min_delay: f64,
    #[serde(default = "d_lightning_max")]
    max_delay: f64,
}

fn d_lightning_min() -> f64 {
    0.5
}

fn d_lightning_max() -> f64 {
    3.0
}

#[derive(Debug)]
enum LightningState {
    Idle,
    FlashOn { remaining: u32 },
    FlashOff { remaining: u32 },
}

#[derive(Debug)]
struct Lightning {
    targets: Targets,
    min_delay: f64,
    max_delay: f64,
    state: LightningState,
}

impl EffectRuntime for Lightning {
    fn tick(&mut self, stage: &mut StageManager, _now: Instant) -> Result<Duration, StageError> {
        let mut rng = rand::thread_rng();

        match self.state {
            LightningState::Idle => {
                let remaining = rng.gen_range(1..=3);
                for idx in self.targets.resolve(stage) {
                    stage.fill_device(idx, 255);
                }
                self.state = LightningState::FlashOff { remaining };
                Ok(sleep_secs(rng.gen_range(0.03..0.08)))
            }
            LightningState::FlashOn { remaining } => {
                for idx in self.targets.resolve(stage) {
                    stage.fill_device(idx, 255);
                }
                self.state = LightningState::FlashOff { remaining };
                Ok(sleep_secs(rng.gen_range(0.03..0.08)))
            }
            LightningState::FlashOff { remaining } => {
                for idx in self.targets.resolve(stage) {
                    stage.fill_device(idx, 0);
                }
                if remaining > 1 {
                    self.state = LightningState::FlashOn {
                        remaining: remaining - 1,
                    };
                    Ok(sleep_secs(rng.gen_range(0.05..0.15)))
                } else {
                    self.state = LightningState::Idle;
                    let min = self.min_delay.min(self.max_delay);
                    let max = self.max_delay.max(self.min_delay);
                    Ok(sleep_secs(rng.gen_range(min..=max)))
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScannerParams {
    #[serde(default = "d_scanner_speed")]
    speed: f64,
    #[serde(default = "d_scanner_range")]
    range: i32,
}

fn d_scanner_speed() -> f64 {
    0.1
}

fn d_scanner_range() -> i32 {
    180
}

const SCANNER_DIMMER_CHANNEL: usize = 5;

#[derive(Debug)]
struct Scanner {
    targets: Targets,
    speed: f64,
    range: i32,
    position: i32,
    rising: bool,
}

impl EffectRuntime for Scanner {
    fn tick(&mut self, stage: &mut StageManager, _now: Instant) -> Result<Duration, StageError> {
        let pan = clamp_channel((self.position as f64 / self.range as f64 * 255.0) as i64);

        for idx in self.targets.resolve(stage) {
            stage.write_device(idx, |d| {
                if !d.values.is_empty() {
                    d.values[0] = pan;
                }
                if d.values.len() > SCANNER_DIMMER_CHANNEL {
                    d.values[SCANNER_DIMMER_CHANNEL] = 255;
                }
            });
        }

        self.position += if self.rising { 5 } else { -5 };
        if self.position >= self.range {
            self.position = self.range;
            self.rising = false;
        } else if self.position <= 0 {
            self.position = 0;
            self.rising = true;
        }

        Ok(sleep_secs(self.speed))
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum MatrixPattern {
    Wave,
    Circle,
    Checker,
}

#[derive(Debug, Deserialize)]
struct MatrixParams {
    #[serde(default = "d_matrix_speed")]
    speed: f64,
    #[serde(default = "d_matrix_pattern")]
    pattern: MatrixPattern,
}

fn d_matrix_speed() -> f64 {
    0.2
}

fn d_matrix_pattern() -> MatrixPattern {
    MatrixPattern::Wave
}

#[derive(Debug)]
struct Matrix {
    targets: Targets,
    speed: f64,
    pattern: MatrixPattern,
    frame: u64,
}

impl EffectRuntime for Matrix {
    fn tick(&mut self, stage: &mut StageManager, _now: Instant) -> Result<Duration, StageError> {
        let resolved = self.targets.resolve(stage);
        if resolved.is_empty() {
            return Ok(sleep_secs(self.speed));
        }

        // Devices are arranged on a near-square grid, row-major.
        let cols = ((resolved.len() as f64).sqrt() as usize).max(1);
        let rows = (resolved.len() + cols - 1) / cols;

        for (i, idx) in resolved.iter().enumerate() {
            let x = i % cols;
            let y = i / cols;

            let intensity = match self.pattern {
                MatrixPattern::Wave => {
                    ((self.frame as f64 * 0.1 + x as f64 * 0.5).sin() + 1.0) / 2.0
                }
                MatrixPattern::Circle => {
                    let center_x = cols as f64 / 2.0;
                    let center_y = rows as f64 / 2.0;
                    let distance = ((x as f64 - center_x).powi(2)
                        + (y as f64 - center_y).powi(2))
                    .sqrt();
                    ((self.frame as f64 * 0.2 - distance * 0.5).sin() + 1.0) / 2.0
                }
                MatrixPattern::Checker => {
                    if (x as u64 + y as u64 + self.frame / 5) % 2 == 0 {
                        1.0
                    } else {
                        0.0
                    }
                }
            };

            stage.fill_device(*idx, (intensity * 255.0) as u8);
        }

        self.frame += 1;
        Ok(sleep_secs(self.speed))
    }
}

#[derive(Debug, Deserialize)]
struct TwinkleParams {
    #[serde(default = "d_twinkle_speed")]
    speed: f64,
    #[serde(default = "d_twinkle_density")]
    density: f64,
}

fn d_twinkle_speed() -> f64 {
    0.1
}

fn d_twinkle_density() -> f64 {
    0.3
}

#[derive(Debug)]
struct Twinkle {
    targets: Targets,
    speed: f64,
    density: f64,
}

impl EffectRuntime for Twinkle {
    fn tick(&mut self, stage: &mut StageManager, _now: Instant) -> Result<Duration, StageError> {
        let mut rng = rand::thread_rng();

        for idx in self.targets.resolve(stage) {
            let brightness = if rng.gen_bool(self.density) {
                rng.gen_range(200..=255)
            } else {
                rng.gen_range(0..=50)
            };
            stage.fill_device(idx, brightness);
        }

        Ok(sleep_secs(self.speed))
    }
}
