use serde::Deserialize;
use std::collections::HashMap;

/// Curated free-text lookup tables, loaded from a JSON file so new calendar
/// names and exception dates can be added without touching code.
#[derive(Deserialize, Debug)]
pub struct GtfsTables {
    //historically observed calendar/service names -> short GTFS-safe ids
    pub calendar_ids: HashMap<String, String>,
    //ordered: groups match by substring against a service id, file order decides row order
    pub exception_dates: Vec<ExceptionRuleSet>,
    pub route_name_replacements: Vec<NameReplacement>,
}

#[derive(Deserialize, Debug)]
pub struct ExceptionRuleSet {
    pub tag: String,
    pub entries: Vec<ExceptionRule>,
}

//GTFS exception_type semantics: 1 = service added, 2 = service removed
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum ExceptionRule {
    Single {
        //"YYYYMMDD"
        date: String,
        #[serde(rename = "type")]
        exception_type: u8,
    },
    Range {
        //"YYYYMMDD" bounds, both inclusive
        range: [String; 2],
        #[serde(rename = "type")]
        exception_type: u8,
    },
}

#[derive(Deserialize, Debug)]
pub struct NameReplacement {
    pub from: String,
    pub to: String,
}

impl GtfsTables {
    pub fn from_json(json: &str) -> Result<GtfsTables, serde_json::Error> {
        serde_json::from_str(json)
    }
}
