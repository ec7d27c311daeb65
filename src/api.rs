use chrono::{Datelike, Local};
use reqwest::Client as ReqwestClient;
use serde::de::DeserializeOwned;
use serde::Deserialize;

//codes used by the OPT-Web frontend to build the rotating apikey header
const DIGIT_CODES: [char; 10] = ['F', 'C', '5', 'Z', 'H', 'S', 'W', '0', '8', 'K'];
const MONTH_CODES: [char; 12] = ['I', '2', 'M', 'O', 'A', 'C', 'B', 'F', '9', 'K', 'V', 'Y'];
const DAY_CODES: [char; 7] = ['T', 'B', 'D', 'N', '0', 'W', 'R'];

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Line {
    pub id: String,
    pub code: String,
    pub name: String,
    pub go_name: Option<String>,
    pub return_name: Option<String>,
    pub directions: Vec<String>,
    pub provider: String,
    pub line_color: i64,
    pub line_color_formatted: Option<LineColor>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct LineColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl LineColor {
    pub fn to_rgba(self) -> rgb::RGBA8 {
        rgb::RGBA8 {
            r: self.r,
            g: self.g,
            b: self.b,
            a: self.a,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub id: i64,
    pub name: String,
    pub code: String,
    #[serde(rename = "type")]
    pub stop_type: i32,
    pub coord_x: f64,
    pub coord_y: f64,
    pub provider: String,
    pub restriction: i32,
    pub regions: Vec<i64>,
    pub description: Option<String>,
    pub transport_type: i32,
    pub cluster: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Calendar {
    pub name: String,
    pub schedules: Vec<i64>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PatternStop {
    pub id: i64,
    pub name: String,
    pub order: i32,
    pub code: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TripStep {
    pub stop_id: i64,
    pub stop_order: i32,
    //"HH:MM"
    pub time: String,
    pub exceptions: Vec<String>,
}

//as returned by the API, exception entries still packed as "<tag>) <description>"
#[derive(Deserialize, Debug)]
struct RawPattern {
    stops: Vec<PatternStop>,
    trips: Vec<Vec<TripStep>>,
    exceptions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Pattern {
    pub stops: Vec<PatternStop>,
    pub trips: Vec<Vec<TripStep>>,
    pub exceptions: Vec<PatternException>,
}

#[derive(Debug, Clone)]
pub struct PatternException {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Return,
}

impl Direction {
    pub fn from_code(code: &str) -> Option<Direction> {
        match code {
            "G" => Some(Direction::Outbound),
            "R" => Some(Direction::Return),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Direction::Outbound => "G",
            Direction::Return => "R",
        }
    }

    pub fn gtfs_direction_id(self) -> u8 {
        match self {
            Direction::Outbound => 0,
            Direction::Return => 1,
        }
    }
}

fn gen_api_key() -> String {
    let now = Local::now();

    let scrambled: String = now
        .timestamp_millis()
        .to_string()
        .chars()
        .filter_map(|c| c.to_digit(10))
        .map(|d| DIGIT_CODES[d as usize])
        .collect();

    let month_code = MONTH_CODES[now.month0() as usize];
    let weekday = now.weekday().num_days_from_monday() as usize;
    let day_code = DAY_CODES[(weekday + 1) % 7];

    format!("{}-{}{}", scrambled, month_code, day_code)
}

fn parse_exception(raw: &str) -> PatternException {
    match raw.split_once(')') {
        Some((id, description)) => PatternException {
            id: id.to_string(),
            description: description.trim().to_string(),
        },
        //no ")" separator, keep the whole string as the tag id
        None => PatternException {
            id: raw.to_string(),
            description: String::new(),
        },
    }
}

pub struct OptWebClient {
    base_url: String,
    provider_name: String,
    client: ReqwestClient,
}

impl OptWebClient {
    pub fn new(url: &str, provider_name: &str) -> OptWebClient {
        OptWebClient {
            base_url: url.trim_end_matches('/').to_string(),
            provider_name: provider_name.to_string(),
            client: ReqwestClient::new(),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, reqwest::Error> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("apikey", gen_api_key())
            .send()
            .await?
            .error_for_status()?;

        response.json::<T>().await
    }

    pub async fn get_lines(&self) -> Result<Vec<Line>, reqwest::Error> {
        self.get_json(&format!("/provider/lines/{}", self.provider_name))
            .await
    }

    pub async fn get_calendars(&self, line_id: &str) -> Result<Vec<Calendar>, reqwest::Error> {
        self.get_json(&format!("/schedule/{}", line_id)).await
    }

    pub async fn get_pattern(
        &self,
        line_id: &str,
        direction: Direction,
        schedule_ids: &[i64],
    ) -> Result<Pattern, reqwest::Error> {
        let ids = schedule_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<String>>()
            .join(",");

        let raw: RawPattern = self
            .get_json(&format!("/trip/{}/{}/{}", line_id, direction.code(), ids))
            .await?;

        Ok(Pattern {
            stops: raw.stops,
            trips: raw.trips,
            exceptions: raw.exceptions.iter().map(|e| parse_exception(e)).collect(),
        })
    }

    pub async fn get_stops_near(
        &self,
        lat: f64,
        lon: f64,
        radius: u32,
    ) -> Result<Vec<Stop>, reqwest::Error> {
        self.get_json(&format!("/stop/{}/{}/{}", lat, lon, radius))
            .await
    }
}
