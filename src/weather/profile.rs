//! Layered weather profile synthesized from a parsed METAR observation.
//!
//! Mirrors the historic FSD weather model: a handful of discrete wind,
//! temperature and cloud layers that simulator clients render directly,
//! rather than a continuous atmospheric model. `feed_metar` fills in what
//! the observation actually reports; `fix` extrapolates the layers the
//! real world doesn't tell us (upper winds, upper temps) from a
//! deterministic pseudo-random stream so repeated queries for the same
//! station return a stable, non-degenerate result.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Datelike, Timelike, Utc};
use once_cell::sync::Lazy;

use super::metar::ParsedMetar;
use super::prng::MRand;
use crate::client::Position;

#[derive(Debug, Clone, Copy, Default)]
pub struct WindLayer {
    pub ceiling: i64,
    pub floor: i64,
    pub direction: i64,
    pub speed: i64,
    pub gusting: i64,
    pub turbulence: i64,
}

impl WindLayer {
    fn new(ceiling: i64, floor: i64) -> Self {
        Self {
            ceiling,
            floor,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TempLayer {
    pub ceiling: i64,
    pub temp: i64,
}

impl TempLayer {
    fn new(ceiling: i64) -> Self {
        Self { ceiling, temp: 0 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CloudLayer {
    pub ceiling: i64,
    pub floor: i64,
    pub coverage: i64,
    pub icing: i64,
    pub turbulence: i64,
}

impl CloudLayer {
    fn new(ceiling: i64, floor: i64) -> Self {
        Self {
            ceiling,
            floor,
            ..Default::default()
        }
    }
}

const VAR_UPDIRECTION: usize = 0;
const VAR_MIDCOR: usize = 1;
const VAR_LOWCOR: usize = 2;
const VAR_MIDDIRECTION: usize = 3;
const VAR_MIDSPEED: usize = 4;
const VAR_LOWDIRECTION: usize = 5;
/// Drawn every redraw to keep the 10-slot stream aligned with the
/// historic generator, but never consumed by `fix` - low-level wind
/// speed there is an average of surface and mid speed, not a draw.
#[allow(dead_code)]
const VAR_LOWSPEED: usize = 6;
const VAR_UPTEMP: usize = 7;
const VAR_MIDTEMP: usize = 8;
const VAR_LOWTEMP: usize = 9;

/// Process-wide variation stream, redrawn once per UTC hour: every profile
/// fixed in the same hour sees the same variation numbers.
struct VariationState {
    last_update_hour: i64,
    variation: [i32; 10],
    rng: MRand,
}

static VARIATION: Lazy<Mutex<VariationState>> = Lazy::new(|| {
    Mutex::new(VariationState {
        last_update_hour: -1,
        variation: [0; 10],
        rng: MRand::new(),
    })
});

fn check_and_get_variation(index: usize, min: i64, max: i64) -> i64 {
    let now = Utc::now();
    let mut state = VARIATION.lock().expect("variation state mutex poisoned");
    let hour = now.hour() as i64;
    if hour != state.last_update_hour {
        let seed = hour * (now.year() as i64 - 1900) * now.month() as i64;
        state.rng.srand(seed as i32);
        for slot in state.variation.iter_mut() {
            *slot = state.rng.next();
        }
        state.last_update_hour = hour;
    }
    let raw = state.variation[index] as i64;
    (raw.abs() % (max - min + 1)) + min
}

fn get_season(month: u32, swap: bool) -> i64 {
    match month {
        12 | 1 | 2 => if swap { 2 } else { 0 },
        3 | 4 | 5 => 1,
        6 | 7 | 8 => if swap { 0 } else { 2 },
        9 | 10 | 11 => 1,
        _ => 0,
    }
}

#[derive(Debug, Clone)]
pub struct WeatherProfile {
    pub creation: u64,
    pub origin: Option<String>,
    pub name: Option<String>,
    pub season: i64,
    pub active: bool,
    pub dew_point: i64,
    pub visibility: f64,
    pub barometer: i64,
    pub winds: [WindLayer; 4],
    pub temps: [TempLayer; 4],
    pub clouds: [CloudLayer; 2],
    pub tstorm: CloudLayer,
}

impl WeatherProfile {
    /// Build a profile from a parsed observation, running `feed_metar`
    /// immediately so a freshly constructed profile is never left with
    /// only its placeholder layer defaults.
    pub fn from_metar(origin: Option<String>, metar: &ParsedMetar) -> Self {
        let mut profile = Self {
            creation: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            origin,
            name: metar.station_id.clone(),
            season: 0,
            active: false,
            dew_point: 0,
            visibility: 15.0,
            barometer: 2950,
            winds: [
                WindLayer::new(-1, -1),
                WindLayer::new(10400, 2500),
                WindLayer::new(22600, 10400),
                WindLayer::new(90000, 20700),
            ],
            temps: [
                TempLayer::new(100),
                TempLayer::new(10000),
                TempLayer::new(18000),
                TempLayer::new(35000),
            ],
            clouds: [CloudLayer::new(-1, -1), CloudLayer::new(-1, -1)],
            tstorm: CloudLayer::new(-1, -1),
        };
        profile.feed_metar(metar);
        profile
    }

    /// Populate layers from the observation. Preserved bit-for-bit from
    /// the historic logic, including the single-sky-layer edge case
    /// where turbulence is hardcoded to 17 rather than computed.
    pub fn feed_metar(&mut self, metar: &ParsedMetar) {
        if let (Some(speed), Some(dir)) = (metar.wind_speed_kt, metar.wind_dir_deg) {
            if metar.wind_gust {
                self.winds[0].gusting = 1;
            }
            self.winds[0].speed = speed;
            self.winds[0].ceiling = 2500;
            self.winds[0].floor = 0;
            self.winds[0].direction = dir;
        }

        if let Some(meters) = metar.vis_meters {
            if meters == 10_000.0 {
                self.visibility = 15.0;
                if !metar.code.contains("9999") {
                    self.clouds[1].ceiling = 26000;
                    self.clouds[1].floor = 24000;
                    self.clouds[1].icing = 0;
                    self.clouds[1].turbulence = 0;
                    self.clouds[1].coverage = 1;
                }
            }
        } else if metar.code.contains("M1/4SM") {
            self.visibility = 0.15;
        } else if let Some(miles) = metar.vis_miles {
            self.visibility = miles;
        }

        for (i, sky) in metar.sky.iter().take(2).enumerate() {
            if let Some(coverage) = sky_coverage(&sky.coverage) {
                self.clouds[i].coverage = coverage;
            }
            if let Some(height) = sky.height_ft {
                self.clouds[i].floor = height;
            }
        }
        if metar.sky.len() >= 2 {
            if self.clouds[1].floor > self.clouds[0].floor {
                self.clouds[0].ceiling =
                    self.clouds[0].floor + (self.clouds[1].floor - self.clouds[0].floor) / 2;
                self.clouds[1].ceiling = self.clouds[1].floor + 3000;
            } else {
                self.clouds[1].ceiling =
                    self.clouds[1].floor + (self.clouds[0].floor - self.clouds[1].floor) / 2;
                self.clouds[0].ceiling = self.clouds[0].floor + 3000;
            }
            self.clouds[0].turbulence = (self.clouds[0].ceiling - self.clouds[0].floor) / 175;
            self.clouds[1].turbulence = (self.clouds[1].ceiling - self.clouds[1].floor) / 175;
        } else if metar.sky.len() == 1 {
            self.clouds[0].ceiling = self.clouds[0].floor + 3000;
            self.clouds[0].turbulence = 17;
        }

        if let (Some(temp), Some(dew)) = (metar.temp_c, metar.dewpoint_c) {
            self.temps[0].temp = temp;
            self.dew_point = dew;
            if (-10..10).contains(&temp) {
                if self.clouds[0].ceiling < 12000 {
                    self.clouds[0].icing = 1;
                }
                if self.clouds[1].ceiling < 12000 {
                    self.clouds[1].icing = 1;
                }
            }
        }

        self.barometer = metar.altimeter_hundredths_inhg.unwrap_or(2992);
    }

    /// Extrapolate upper-level wind/temp layers at a specific point on
    /// the globe, using the process-wide hourly variation stream.
    pub fn fix(&mut self, position: Position) {
        let (lat, lon) = position;
        let a2 = (lon / 18.0).abs();
        let now = Utc::now();
        self.season = get_season(now.month(), lat < 0.0);
        let sign = if lat > 0.0 { 6.0 } else { -6.0 };

        let lat_var = check_and_get_variation(VAR_UPDIRECTION, -25, 25) as f64;
        self.winds[3].direction = (((sign * lat + lat_var + a2).round() as i64) % 360 + 360) % 360;

        let max_velocity = match self.season {
            0 => 120.0,
            1 => 80.0,
            2 => 50.0,
            _ => 0.0,
        };
        self.winds[3].speed = ((lat * std::f64::consts::PI / 180.0).sin().abs() * max_velocity).round() as i64;

        let lat_var = check_and_get_variation(VAR_MIDDIRECTION, 10, 45) as f64;
        let coriolis_var = check_and_get_variation(VAR_MIDCOR, 10, 30) as f64;
        self.winds[2].direction =
            (((sign * lat + lat_var + a2 - coriolis_var).round() as i64) % 360 + 360) % 360;
        self.winds[2].speed =
            (self.winds[3].speed as f64 * (check_and_get_variation(VAR_MIDSPEED, 500, 800) as f64 / 1000.0)) as i64;

        let coriolis_var_low = coriolis_var + check_and_get_variation(VAR_LOWCOR, 10, 30) as f64;
        let lat_var = check_and_get_variation(VAR_LOWDIRECTION, 10, 45) as f64;
        self.winds[1].direction =
            (((sign * lat + lat_var + a2 - coriolis_var_low).round() as i64) % 360 + 360) % 360;
        self.winds[1].speed = (self.winds[0].speed + self.winds[1].speed) / 2;

        self.temps[3].temp = -57 + check_and_get_variation(VAR_UPTEMP, -4, 4);
        self.temps[2].temp = -21 + check_and_get_variation(VAR_MIDTEMP, -7, 7);
        self.temps[1].temp = -5 + check_and_get_variation(VAR_LOWTEMP, -12, 12);
    }
}

fn sky_coverage(token: &str) -> Option<i64> {
    match token {
        "SKC" | "CLR" => Some(0),
        "FEW" => Some(1),
        "SCT" => Some(3),
        "BKN" => Some(5),
        "OVC" => Some(8),
        "VV" => Some(8),
        _ => None,
    }
}
