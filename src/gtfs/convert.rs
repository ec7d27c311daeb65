use csv::{QuoteStyle, Writer, WriterBuilder};
use std::collections::HashSet;

use crate::api::{Calendar, Direction, Line, Pattern, Stop, TripStep};
use crate::gtfs::calendar::{exceptions_for_service_id, service_name_to_calendar_id};
use crate::gtfs::tables::GtfsTables;
use crate::gtfs::textutil::{normalize_route_name, to_hex_color};

const STOPS_HEADER: [&str; 6] = [
    "stop_id",
    "stop_code",
    "stop_name",
    "stop_desc",
    "stop_lat",
    "stop_lon",
];
//route_color appears twice on purpose, the downstream feed merger expects both columns
const ROUTES_HEADER: [&str; 9] = [
    "route_id",
    "agency_id",
    "route_short_name",
    "route_long_name",
    "route_color",
    "route_type",
    "route_color",
    "route_text_color",
    "original_route_long_name",
];
const TRIPS_HEADER: &str = "route_id,service_id,trip_id,direction_id";
const STOP_TIMES_HEADER: &str = "trip_id,arrival_time,departure_time,stop_id,stop_sequence,timepoint";

//free text is written as-is, so embedded commas corrupt columns; known limitation
fn gtfs_writer() -> Writer<Vec<u8>> {
    WriterBuilder::new()
        .quote_style(QuoteStyle::Never)
        .from_writer(vec![])
}

fn finish_csv(wtr: Writer<Vec<u8>>) -> String {
    let bytes = wtr.into_inner().unwrap();
    let text = String::from_utf8(bytes).unwrap();
    text.trim_end_matches('\n').to_string()
}

pub fn stops_to_gtfs_stops(stops: &[Stop]) -> String {
    let mut wtr = gtfs_writer();
    wtr.write_record(STOPS_HEADER).unwrap();

    for stop in stops {
        wtr.write_record([
            stop.id.to_string(),
            stop.code.clone(),
            stop.name.clone(),
            stop.description.clone().unwrap_or_default(),
            stop.coord_x.to_string(),
            stop.coord_y.to_string(),
        ])
        .unwrap();
    }

    finish_csv(wtr)
}

pub fn lines_to_gtfs_routes(
    tables: &GtfsTables,
    lines: &[Line],
    agency_id: &str,
    route_type: &str,
    default_route_color: &str,
    default_route_text_color: &str,
) -> String {
    let mut wtr = gtfs_writer();
    wtr.write_record(ROUTES_HEADER).unwrap();

    for line in lines {
        let route_color = line
            .line_color_formatted
            .map(|color| to_hex_color(color.to_rgba()))
            .unwrap_or_default();

        wtr.write_record([
            line.id.clone(),
            agency_id.to_string(),
            line.code.clone(),
            normalize_route_name(&tables.route_name_replacements, &line.name),
            route_color,
            route_type.to_string(),
            default_route_color.to_string(),
            default_route_text_color.to_string(),
            line.name.clone(),
        ])
        .unwrap();
    }

    finish_csv(wtr)
}

struct TripIdentity {
    service_id: String,
    trip_id: String,
}

/// Shared identity derivation for the trips and stop_times generators. The
/// trip id folds service, line, direction, step count and the two endpoint
/// times; structurally identical trips from repeated fetches collapse onto
/// the same id, which is exactly the dedup key. The stop-by-stop path is
/// deliberately not part of the key (see the known-limitation test below).
fn trip_identity(
    tables: &GtfsTables,
    trip_prefix: &str,
    line: &Line,
    direction_id: u8,
    calendar: &Calendar,
    pattern: &Pattern,
    steps: &[TripStep],
) -> Option<TripIdentity> {
    let first = steps.first()?;
    let last = steps.last()?;

    //exception tags ride on the first stop of the trip; unresolved tags are dropped
    let descriptions: Vec<&str> = first
        .exceptions
        .iter()
        .filter_map(|tag| pattern.exceptions.iter().find(|ex| &ex.id == tag))
        .map(|ex| ex.description.as_str())
        .filter(|description| !description.is_empty())
        .collect();

    let service_name = if descriptions.is_empty() {
        calendar.name.clone()
    } else {
        format!("{} ({})", calendar.name, descriptions.join(";"))
    };
    let service_id = service_name_to_calendar_id(tables, &service_name);

    let trip_id = format!(
        "{}_{}_{}_{}_{}_{}_{}",
        trip_prefix,
        service_id,
        line.code,
        direction_id,
        steps.len(),
        first.time,
        last.time
    );

    Some(TripIdentity {
        service_id,
        trip_id,
    })
}

#[derive(Debug, Default)]
pub struct PatternSynthesis {
    pub trips: String,
    pub calendar_dates: String,
    pub trip_ids: HashSet<String>,
    pub service_ids: HashSet<String>,
}

/// Turn one (line, direction, calendar, pattern) fetch into trips and
/// calendar_dates chunks. The two ledger arguments are what previous calls
/// already emitted; they are only read, and the incremental additions come
/// back in the result for the caller to merge.
pub fn pattern_to_gtfs_trips_and_calendar_dates(
    tables: &GtfsTables,
    trip_prefix: &str,
    line: &Line,
    direction: Direction,
    calendar: &Calendar,
    pattern: &Pattern,
    include_header: bool,
    processed_trip_ids: &HashSet<String>,
    processed_service_ids: &HashSet<String>,
) -> PatternSynthesis {
    let direction_id = direction.gtfs_direction_id();

    let mut trip_lines: Vec<String> = Vec::new();
    let mut calendar_dates_lines: Vec<String> = Vec::new();
    if include_header {
        trip_lines.push(TRIPS_HEADER.to_string());
        calendar_dates_lines.push("service_id,date,exception_type".to_string());
    }

    let mut trip_ids: HashSet<String> = HashSet::new();
    let mut service_ids: HashSet<String> = HashSet::new();

    for steps in &pattern.trips {
        let Some(identity) =
            trip_identity(tables, trip_prefix, line, direction_id, calendar, pattern, steps)
        else {
            continue;
        };

        //expand each service's calendar dates at most once per run
        if !processed_service_ids.contains(&identity.service_id)
            && !service_ids.contains(&identity.service_id)
        {
            service_ids.insert(identity.service_id.clone());
            calendar_dates_lines.extend(exceptions_for_service_id(
                tables,
                &identity.service_id,
                false,
            ));
        }

        //a trip id already emitted earlier in the run is suppressed here
        if processed_trip_ids.contains(&identity.trip_id) || trip_ids.contains(&identity.trip_id) {
            continue;
        }
        trip_ids.insert(identity.trip_id.clone());

        trip_lines.push(format!(
            "{},{},{},{}",
            line.id, identity.service_id, identity.trip_id, direction_id
        ));
    }

    PatternSynthesis {
        trips: trip_lines.join("\n"),
        calendar_dates: calendar_dates_lines.join("\n"),
        trip_ids,
        service_ids,
    }
}

/// Sibling of the trips generator: same identity derivation, same ledger
/// check, so both must be handed the same ledger state or trips and
/// stop_times drift apart.
pub fn pattern_to_gtfs_stop_times(
    tables: &GtfsTables,
    trip_prefix: &str,
    line: &Line,
    direction: Direction,
    calendar: &Calendar,
    pattern: &Pattern,
    include_header: bool,
    processed_trip_ids: &HashSet<String>,
) -> (String, HashSet<String>) {
    let direction_id = direction.gtfs_direction_id();

    let mut stop_time_lines: Vec<String> = Vec::new();
    if include_header {
        stop_time_lines.push(STOP_TIMES_HEADER.to_string());
    }

    let mut trip_ids: HashSet<String> = HashSet::new();

    for steps in &pattern.trips {
        let Some(identity) =
            trip_identity(tables, trip_prefix, line, direction_id, calendar, pattern, steps)
        else {
            continue;
        };

        if processed_trip_ids.contains(&identity.trip_id) || trip_ids.contains(&identity.trip_id) {
            continue;
        }
        trip_ids.insert(identity.trip_id.clone());

        for (index, step) in steps.iter().enumerate() {
            //exact scheduled times only at the endpoints, the rest are interpolated
            let timepoint = if index == 0 || index == steps.len() - 1 {
                1
            } else {
                0
            };

            stop_time_lines.push(format!(
                "{},{}:00,{}:00,{},{},{}",
                identity.trip_id,
                step.time,
                step.time,
                step.stop_id,
                index + 1,
                timepoint
            ));
        }
    }

    (stop_time_lines.join("\n"), trip_ids)
}

/// The two growing ledgers threaded through a run: trip ids already written
/// to trips.txt/stop_times.txt and service ids already expanded into
/// calendar_dates.txt.
#[derive(Debug, Default, Clone)]
pub struct ProcessedIds {
    pub trip_ids: HashSet<String>,
    pub service_ids: HashSet<String>,
}

/// One direction's worth of synthesized output, produced against a ledger
/// snapshot while other directions of the same line run concurrently.
#[derive(Debug, Default)]
pub struct DirectionBatch {
    pub trips: Vec<String>,
    pub stop_times: Vec<String>,
    pub calendar_dates: Vec<String>,
    pub trip_ids: HashSet<String>,
    pub service_ids: HashSet<String>,
}

//date and exception_type carry no commas, so the service id is everything
//before the last two fields (it may itself contain commas when it is an
//unmapped quoted literal)
fn calendar_row_service_id(row: &str) -> &str {
    let mut end = row.len();
    for _ in 0..2 {
        end = row[..end].rfind(',').unwrap_or(0);
    }
    &row[..end]
}

/// Fold one direction batch into the run state. Batches are merged in
/// direction order after the fan-out joins; because each direction worked
/// from a ledger snapshot, two directions can both expand a service id, and
/// the later batch's duplicate calendar_dates rows are dropped here. Trip ids
/// embed the direction id, so they cannot collide across the fan-out.
pub fn merge_direction_batch(
    ledgers: &mut ProcessedIds,
    batch: DirectionBatch,
    trips_out: &mut Vec<String>,
    stop_times_out: &mut Vec<String>,
    calendar_dates_out: &mut Vec<String>,
) {
    for chunk in batch.trips {
        if !chunk.is_empty() {
            trips_out.push(chunk);
        }
    }
    for chunk in batch.stop_times {
        if !chunk.is_empty() {
            stop_times_out.push(chunk);
        }
    }
    for chunk in batch.calendar_dates {
        let kept: Vec<&str> = chunk
            .lines()
            .filter(|row| !ledgers.service_ids.contains(calendar_row_service_id(row)))
            .collect();
        if !kept.is_empty() {
            calendar_dates_out.push(kept.join("\n"));
        }
    }

    ledgers.trip_ids.extend(batch.trip_ids);
    ledgers.service_ids.extend(batch.service_ids);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LineColor, PatternException, PatternStop};

    fn tables() -> GtfsTables {
        GtfsTables::from_json(include_str!("../../data/alentejo-tables.json")).unwrap()
    }

    fn line() -> Line {
        Line {
            id: "8778".to_string(),
            code: "0810".to_string(),
            name: "PORTALEGRE P/ EVORA".to_string(),
            go_name: None,
            return_name: Some("EVORA P/ PORTALEGRE".to_string()),
            directions: vec!["G".to_string(), "R".to_string()],
            provider: "TAA".to_string(),
            line_color: 16744448,
            line_color_formatted: Some(LineColor {
                r: 255,
                g: 128,
                b: 0,
                a: 255,
            }),
        }
    }

    fn calendar() -> Calendar {
        Calendar {
            name: "Dias Úteis".to_string(),
            schedules: vec![1, 2],
        }
    }

    fn step(stop_id: i64, order: i32, time: &str, exceptions: &[&str]) -> TripStep {
        TripStep {
            stop_id,
            stop_order: order,
            time: time.to_string(),
            exceptions: exceptions.iter().map(|e| e.to_string()).collect(),
        }
    }

    fn pattern_stop(id: i64, order: i32) -> PatternStop {
        PatternStop {
            id,
            name: format!("Stop {}", id),
            order,
            code: format!("C{}", id),
        }
    }

    fn pattern() -> Pattern {
        Pattern {
            stops: vec![pattern_stop(101, 1), pattern_stop(102, 2), pattern_stop(103, 3)],
            trips: vec![
                vec![
                    step(101, 1, "08:00", &["3"]),
                    step(102, 2, "08:15", &[]),
                    step(103, 3, "08:30", &[]),
                ],
                vec![
                    step(101, 1, "17:00", &["3"]),
                    step(102, 2, "17:15", &[]),
                    step(103, 3, "17:30", &[]),
                ],
            ],
            exceptions: vec![PatternException {
                id: "3".to_string(),
                description: "Escolar (exceto Agosto)".to_string(),
            }],
        }
    }

    #[test]
    fn test_stops_formatter() {
        let stops = vec![Stop {
            id: 42,
            name: "Largo da Feira".to_string(),
            code: "LF1".to_string(),
            stop_type: 0,
            coord_x: 39.29,
            coord_y: -7.43,
            provider: "TAA".to_string(),
            restriction: 0,
            regions: vec![],
            description: None,
            transport_type: 1,
            cluster: None,
        }];

        let csv = stops_to_gtfs_stops(&stops);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("stop_id,stop_code,stop_name,stop_desc,stop_lat,stop_lon")
        );
        assert_eq!(lines.next(), Some("42,LF1,Largo da Feira,,39.29,-7.43"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_routes_formatter() {
        let tables = tables();
        let csv = lines_to_gtfs_routes(&tables, &[line()], "TAA", "3", "", "");
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some(
                "route_id,agency_id,route_short_name,route_long_name,route_color,route_type,\
                 route_color,route_text_color,original_route_long_name"
            )
        );
        assert_eq!(
            lines.next(),
            Some("8778,TAA,0810,Portalegre via Évora,#ff8000ff,3,,,PORTALEGRE P/ EVORA")
        );
    }

    #[test]
    fn test_trip_rows_and_service_resolution() {
        let tables = tables();
        let out = pattern_to_gtfs_trips_and_calendar_dates(
            &tables,
            "63_4",
            &line(),
            Direction::Outbound,
            &calendar(),
            &pattern(),
            true,
            &HashSet::new(),
            &HashSet::new(),
        );

        let rows: Vec<&str> = out.trips.lines().collect();
        assert_eq!(rows[0], TRIPS_HEADER);
        //the tagged first stop promotes "Dias Úteis" to its annotated variant
        assert_eq!(
            rows[1],
            "8778,ESC-DU-XAGO,63_4_ESC-DU-XAGO_0810_0_3_08:00_08:30,0"
        );
        assert_eq!(
            rows[2],
            "8778,ESC-DU-XAGO,63_4_ESC-DU-XAGO_0810_0_3_17:00_17:30,0"
        );
        assert_eq!(out.trip_ids.len(), 2);
        assert_eq!(out.service_ids.len(), 1);

        //one expansion for the one new service id: ESC + XAGO tag groups
        let expected =
            exceptions_for_service_id(&tables, "ESC-DU-XAGO", false);
        let date_rows: Vec<&str> = out.calendar_dates.lines().skip(1).collect();
        assert_eq!(date_rows.len(), expected.len());
    }

    #[test]
    fn test_unresolved_exception_tags_are_dropped() {
        let tables = tables();
        let mut pattern = pattern();
        //tag "99" has no entry in the pattern's exception table
        pattern.trips[0][0].exceptions = vec!["99".to_string()];
        pattern.trips[1][0].exceptions = vec!["99".to_string()];

        let out = pattern_to_gtfs_trips_and_calendar_dates(
            &tables,
            "63_4",
            &line(),
            Direction::Outbound,
            &calendar(),
            &pattern,
            false,
            &HashSet::new(),
            &HashSet::new(),
        );

        //with all tags dropped the plain calendar name resolves to DU
        assert!(out.service_ids.contains("DU"));
        assert!(out
            .trips
            .lines()
            .all(|row| row.contains(",DU,63_4_DU_0810_0_3_")));
    }

    #[test]
    fn test_synthesis_is_idempotent_across_calls() {
        let tables = tables();
        let first = pattern_to_gtfs_trips_and_calendar_dates(
            &tables,
            "63_4",
            &line(),
            Direction::Outbound,
            &calendar(),
            &pattern(),
            false,
            &HashSet::new(),
            &HashSet::new(),
        );

        //carry the ledgers forward and synthesize the identical pattern again
        let second = pattern_to_gtfs_trips_and_calendar_dates(
            &tables,
            "63_4",
            &line(),
            Direction::Outbound,
            &calendar(),
            &pattern(),
            false,
            &first.trip_ids,
            &first.service_ids,
        );

        assert_eq!(second.trips, "");
        assert_eq!(second.calendar_dates, "");
        assert!(second.trip_ids.is_empty());
        assert!(second.service_ids.is_empty());

        let (stop_times, _) = pattern_to_gtfs_stop_times(
            &tables,
            "63_4",
            &line(),
            Direction::Outbound,
            &calendar(),
            &pattern(),
            false,
            &first.trip_ids,
        );
        assert_eq!(stop_times, "");
    }

    #[test]
    fn test_identical_endpoints_collapse_even_with_different_paths() {
        //known limitation: the dedup key ignores the stop-by-stop path, so two
        //genuinely different stop sequences sharing count and endpoint times
        //fold into a single trip row
        let tables = tables();
        let mut pattern = pattern();
        pattern.trips[1] = vec![
            step(201, 1, "08:00", &["3"]),
            step(202, 2, "08:10", &[]),
            step(203, 3, "08:30", &[]),
        ];

        let out = pattern_to_gtfs_trips_and_calendar_dates(
            &tables,
            "63_4",
            &line(),
            Direction::Outbound,
            &calendar(),
            &pattern,
            false,
            &HashSet::new(),
            &HashSet::new(),
        );

        assert_eq!(out.trips.lines().count(), 1);
        assert_eq!(out.trip_ids.len(), 1);
    }

    #[test]
    fn test_stop_times_rows_and_timepoints() {
        let tables = tables();
        let (csv, trip_ids) = pattern_to_gtfs_stop_times(
            &tables,
            "63_4",
            &line(),
            Direction::Return,
            &calendar(),
            &pattern(),
            true,
            &HashSet::new(),
        );

        let rows: Vec<&str> = csv.lines().collect();
        assert_eq!(rows[0], STOP_TIMES_HEADER);
        assert_eq!(
            rows[1],
            "63_4_ESC-DU-XAGO_0810_1_3_08:00_08:30,08:00:00,08:00:00,101,1,1"
        );
        assert_eq!(
            rows[2],
            "63_4_ESC-DU-XAGO_0810_1_3_08:00_08:30,08:15:00,08:15:00,102,2,0"
        );
        assert_eq!(
            rows[3],
            "63_4_ESC-DU-XAGO_0810_1_3_08:00_08:30,08:30:00,08:30:00,103,3,1"
        );
        assert_eq!(trip_ids.len(), 2);
    }

    #[test]
    fn test_single_stop_trip_is_still_a_timepoint() {
        let tables = tables();
        let pattern = Pattern {
            stops: vec![pattern_stop(101, 1)],
            trips: vec![vec![step(101, 1, "09:00", &[])]],
            exceptions: vec![],
        };

        let (csv, _) = pattern_to_gtfs_stop_times(
            &tables,
            "63_4",
            &line(),
            Direction::Outbound,
            &calendar(),
            &pattern,
            false,
            &HashSet::new(),
        );

        assert_eq!(csv, "63_4_DU_0810_0_1_09:00_09:00,09:00:00,09:00:00,101,1,1");
    }

    #[test]
    fn test_empty_trip_is_skipped() {
        let tables = tables();
        let pattern = Pattern {
            stops: vec![],
            trips: vec![vec![]],
            exceptions: vec![],
        };

        let out = pattern_to_gtfs_trips_and_calendar_dates(
            &tables,
            "63_4",
            &line(),
            Direction::Outbound,
            &calendar(),
            &pattern,
            false,
            &HashSet::new(),
            &HashSet::new(),
        );
        assert_eq!(out.trips, "");
        assert!(out.trip_ids.is_empty());
    }

    #[test]
    fn test_merge_drops_calendar_dates_already_expanded() {
        let mut ledgers = ProcessedIds::default();
        let mut trips_out = Vec::new();
        let mut stop_times_out = Vec::new();
        let mut calendar_dates_out = Vec::new();

        let outbound = DirectionBatch {
            trips: vec!["8778,DU-XAGO,63_4_DU-XAGO_0810_0_3_08:00_08:30,0".to_string()],
            stop_times: vec![],
            calendar_dates: vec!["DU-XAGO,20250801,2\nDU-XAGO,20250802,2".to_string()],
            trip_ids: HashSet::from(["63_4_DU-XAGO_0810_0_3_08:00_08:30".to_string()]),
            service_ids: HashSet::from(["DU-XAGO".to_string()]),
        };
        //the concurrent return direction worked from the same snapshot and
        //expanded the same service id
        let inbound = DirectionBatch {
            trips: vec!["8778,DU-XAGO,63_4_DU-XAGO_0810_1_3_08:00_08:30,1".to_string()],
            stop_times: vec![],
            calendar_dates: vec!["DU-XAGO,20250801,2\nDU-XAGO,20250802,2".to_string()],
            trip_ids: HashSet::from(["63_4_DU-XAGO_0810_1_3_08:00_08:30".to_string()]),
            service_ids: HashSet::from(["DU-XAGO".to_string()]),
        };

        merge_direction_batch(
            &mut ledgers,
            outbound,
            &mut trips_out,
            &mut stop_times_out,
            &mut calendar_dates_out,
        );
        merge_direction_batch(
            &mut ledgers,
            inbound,
            &mut trips_out,
            &mut stop_times_out,
            &mut calendar_dates_out,
        );

        assert_eq!(trips_out.len(), 2);
        //the duplicate expansion from the second batch was dropped
        assert_eq!(
            calendar_dates_out,
            vec!["DU-XAGO,20250801,2\nDU-XAGO,20250802,2".to_string()]
        );
        assert_eq!(ledgers.trip_ids.len(), 2);
        assert_eq!(ledgers.service_ids.len(), 1);
    }

    #[test]
    fn test_merge_keeps_header_and_quoted_service_ids() {
        let mut ledgers = ProcessedIds::default();
        ledgers
            .service_ids
            .insert("\"Dias Santos, talvez (Novo)\"".to_string());
        let mut trips_out = Vec::new();
        let mut stop_times_out = Vec::new();
        let mut calendar_dates_out = Vec::new();

        let batch = DirectionBatch {
            trips: vec![],
            stop_times: vec![],
            calendar_dates: vec![
                //header row survives, the quoted literal with a comma is matched whole
                "service_id,date,exception_type\n\"Dias Santos, talvez (Novo)\",20250801,2"
                    .to_string(),
            ],
            trip_ids: HashSet::new(),
            service_ids: HashSet::new(),
        };

        merge_direction_batch(
            &mut ledgers,
            batch,
            &mut trips_out,
            &mut stop_times_out,
            &mut calendar_dates_out,
        );

        assert_eq!(
            calendar_dates_out,
            vec!["service_id,date,exception_type".to_string()]
        );
    }

    #[test]
    fn test_calendar_row_service_id_extraction() {
        assert_eq!(calendar_row_service_id("ESC-DU,20250801,2"), "ESC-DU");
        assert_eq!(
            calendar_row_service_id("\"Dias Úteis, talvez\",20250801,2"),
            "\"Dias Úteis, talvez\""
        );
        assert_eq!(
            calendar_row_service_id("service_id,date,exception_type"),
            "service_id"
        );
    }
}
