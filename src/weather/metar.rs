//! Minimal METAR observation parser.
//!
//! Implements just the handful of fields [`crate::weather::profile`]
//! actually reads (wind, visibility, sky layers, temperature/dewpoint,
//! altimeter) via a tokenizer over the space-separated report body.

use once_cell::sync::Lazy;
use regex::Regex;

static WIND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<dir>\d{3}|VRB)(?P<speed>\d{2,3})(G(?P<gust>\d{2,3}))?KT$").unwrap());
static VIS_SM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?P<whole>\d{1,2})SM$").unwrap());
static VIS_FRAC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<num>\d)/(?P<den>\d)SM$").unwrap());
static VIS_METERS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}$").unwrap());
static SKY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<cover>SKC|CLR|VV|FEW|SCT|BKN|OVC)(?P<height>\d{3})?$").unwrap());
static TEMP_DEW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<temp>M?\d{2})/(?P<dew>M?\d{2})$").unwrap());
static ALTIMETER_IN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^A(?P<value>\d{4})$").unwrap());
static ALTIMETER_HPA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Q(?P<value>\d{4})$").unwrap());

/// A single sky condition group: coverage string plus the reported base
/// height in feet, when given (`SKC`/`CLR` carry none).
#[derive(Debug, Clone)]
pub struct SkyLayer {
    pub coverage: String,
    pub height_ft: Option<i64>,
}

/// The handful of METAR fields the weather profile synthesizer consumes.
#[derive(Debug, Clone, Default)]
pub struct ParsedMetar {
    pub station_id: Option<String>,
    pub code: String,
    pub wind_dir_deg: Option<i64>,
    pub wind_speed_kt: Option<i64>,
    pub wind_gust: bool,
    /// Visibility in meters, when reported that way (e.g. `9999`).
    pub vis_meters: Option<f64>,
    /// Visibility in statute miles, when reported that way (e.g. `10SM`).
    pub vis_miles: Option<f64>,
    pub sky: Vec<SkyLayer>,
    pub temp_c: Option<i64>,
    pub dewpoint_c: Option<i64>,
    /// Altimeter setting in hundredths of inHg (e.g. 2992 for 29.92").
    pub altimeter_hundredths_inhg: Option<i64>,
}

/// Parse one raw METAR report line, taking the report month/year from the
/// surrounding context (usually a preceding ISO timestamp line, see
/// [`super::fetch`]) since the report itself carries only day-of-month.
pub fn parse(raw: &str) -> ParsedMetar {
    let code = raw.trim().to_string();
    let mut metar = ParsedMetar {
        code: code.clone(),
        ..Default::default()
    };

    let tokens: Vec<&str> = code.split_whitespace().collect();
    if let Some(first) = tokens.first() {
        if first.len() == 4 && first.chars().all(|c| c.is_ascii_alphanumeric()) {
            metar.station_id = Some(first.to_string());
        }
    }

    for token in &tokens {
        if let Some(caps) = WIND_RE.captures(token) {
            if let Ok(dir) = caps["dir"].parse::<i64>() {
                metar.wind_dir_deg = Some(dir);
            }
            if let Ok(speed) = caps["speed"].parse::<i64>() {
                metar.wind_speed_kt = Some(speed);
            }
            metar.wind_gust = caps.name("gust").is_some();
            continue;
        }
        if let Some(caps) = VIS_SM_RE.captures(token) {
            metar.vis_miles = caps["whole"].parse().ok();
            continue;
        }
        if let Some(caps) = VIS_FRAC_RE.captures(token) {
            let num: f64 = caps["num"].parse().unwrap_or(0.0);
            let den: f64 = caps["den"].parse().unwrap_or(1.0);
            if den != 0.0 {
                metar.vis_miles = Some(num / den);
            }
            continue;
        }
        if *token == "9999" {
            metar.vis_meters = Some(10_000.0);
            continue;
        } else if VIS_METERS_RE.is_match(token) {
            metar.vis_meters = token.parse().ok();
            continue;
        }
        if let Some(caps) = SKY_RE.captures(token) {
            let height_ft = caps
                .name("height")
                .and_then(|m| m.as_str().parse::<i64>().ok())
                .map(|hundreds| hundreds * 100);
            metar.sky.push(SkyLayer {
                coverage: caps["cover"].to_string(),
                height_ft,
            });
            continue;
        }
        if let Some(caps) = TEMP_DEW_RE.captures(token) {
            metar.temp_c = parse_signed_temp(&caps["temp"]);
            metar.dewpoint_c = parse_signed_temp(&caps["dew"]);
            continue;
        }
        if let Some(caps) = ALTIMETER_IN_RE.captures(token) {
            metar.altimeter_hundredths_inhg = caps["value"].parse().ok();
            continue;
        }
        if let Some(caps) = ALTIMETER_HPA_RE.captures(token) {
            let hpa: f64 = caps["value"].parse().unwrap_or(0.0);
            metar.altimeter_hundredths_inhg = Some((hpa * 100.0 / 33.8639) as i64);
        }
    }

    metar
}

fn parse_signed_temp(token: &str) -> Option<i64> {
    if let Some(rest) = token.strip_prefix('M') {
        rest.parse::<i64>().ok().map(|v| -v)
    } else {
        token.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wind_visibility_sky_temp_altimeter() {
        let metar = parse("KJFK 121851Z 18010G20KT 10SM SCT030 OVC080 18/12 A2992");
        assert_eq!(metar.station_id.as_deref(), Some("KJFK"));
        assert_eq!(metar.wind_dir_deg, Some(180));
        assert_eq!(metar.wind_speed_kt, Some(10));
        assert!(metar.wind_gust);
        assert_eq!(metar.vis_miles, Some(10.0));
        assert_eq!(metar.sky.len(), 2);
        assert_eq!(metar.sky[0].coverage, "SCT");
        assert_eq!(metar.sky[0].height_ft, Some(3000));
        assert_eq!(metar.temp_c, Some(18));
        assert_eq!(metar.dewpoint_c, Some(12));
        assert_eq!(metar.altimeter_hundredths_inhg, Some(2992));
    }

    #[test]
    fn parses_negative_temperatures_and_calm_sky() {
        let metar = parse("LOWI 121851Z 00000KT 9999 CLR M05/M10 Q1013");
        assert_eq!(metar.temp_c, Some(-5));
        assert_eq!(metar.dewpoint_c, Some(-10));
        assert_eq!(metar.vis_meters, Some(10_000.0));
        assert_eq!(metar.sky.len(), 1);
        assert_eq!(metar.sky[0].coverage, "CLR");
        assert!(metar.altimeter_hundredths_inhg.is_some());
    }

    #[test]
    fn fractional_visibility() {
        let metar = parse("KXYZ 010000Z 1/4SM");
        assert_eq!(metar.vis_miles, Some(0.25));
    }
}
