use chrono::NaiveDate;
use log::warn;

use crate::gtfs::tables::{ExceptionRule, GtfsTables};

const CALENDAR_DATES_HEADER: &str = "service_id,date,exception_type";
const DATE_FORMAT: &str = "%Y%m%d";

/// Resolve a composite service name ("Dias Úteis (Escolar)") to a short
/// GTFS-safe calendar id. Unmapped names come back wrapped in quotes so they
/// stand out in the output until someone adds a table entry.
pub fn service_name_to_calendar_id(tables: &GtfsTables, service_name: &str) -> String {
    match tables.calendar_ids.get(service_name) {
        Some(id) => id.clone(),
        None => format!("\"{}\"", service_name),
    }
}

/// Expand the symbolic tags embedded in a service id ("ESC-DU-XAGO" carries
/// ESC, DU and XAGO) into concrete calendar_dates rows. Matching is plain
/// substring containment; every matching rule group contributes rows, and any
/// dedup across calls is the caller's responsibility.
pub fn exceptions_for_service_id(
    tables: &GtfsTables,
    service_id: &str,
    include_header: bool,
) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    if include_header {
        lines.push(CALENDAR_DATES_HEADER.to_string());
    }

    for rule_set in &tables.exception_dates {
        if !service_id.contains(&rule_set.tag) {
            continue;
        }

        for entry in &rule_set.entries {
            match entry {
                ExceptionRule::Single {
                    date,
                    exception_type,
                } => {
                    lines.push(format!("{},{},{}", service_id, date, exception_type));
                }
                ExceptionRule::Range {
                    range,
                    exception_type,
                } => {
                    let parsed = (
                        NaiveDate::parse_from_str(&range[0], DATE_FORMAT),
                        NaiveDate::parse_from_str(&range[1], DATE_FORMAT),
                    );
                    let (Ok(start), Ok(end)) = parsed else {
                        warn!(
                            "unparseable date range {:?} under tag {}, skipping",
                            range, rule_set.tag
                        );
                        continue;
                    };

                    let mut current = start;
                    while current <= end {
                        lines.push(format!(
                            "{},{},{}",
                            service_id,
                            current.format(DATE_FORMAT),
                            exception_type
                        ));
                        match current.succ_opt() {
                            Some(next) => current = next,
                            None => break,
                        }
                    }
                }
            }
        }
    }

    lines
}
