use color_eyre::eyre::{eyre, Result};
use futures::future::join_all;
use log::{info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use optgtfs::api::{Direction, Line, OptWebClient};
use optgtfs::gtfs::convert::{
    lines_to_gtfs_routes, merge_direction_batch, pattern_to_gtfs_stop_times,
    pattern_to_gtfs_trips_and_calendar_dates, stops_to_gtfs_stops, DirectionBatch, ProcessedIds,
};
use optgtfs::gtfs::tables::GtfsTables;

const TABLES_PATH: &str = "data/alentejo-tables.json";
const OUT_DIR: &str = "gtfs-out";

const ROUTE_TYPE_BUS: &str = "3";
//feed id the aggregator assigned to the Alentejo import
const TRIP_PREFIX: &str = "63_4";

//center of the Alentejo coverage area and a radius wide enough for all of it
const STOPS_QUERY_LAT: f64 = 39.50404057338466;
const STOPS_QUERY_LON: f64 = -8.997802734375002;
const STOPS_QUERY_RADIUS: u32 = 532887;

//the API has no documented rate limit, but hammering it gets the IP blocked
const INTER_LINE_DELAY: Duration = Duration::from_millis(1000);

struct Provider {
    url: &'static str,
    name: &'static str,
}

const PROVIDERS: [Provider; 4] = [
    Provider {
        url: "https://tpac.pt/",
        name: "TAC",
    },
    Provider {
        url: "https://www.transportesaltoalentejo.pt/",
        name: "TAA",
    },
    Provider {
        url: "https://www.trimbal.pt/",
        name: "TRIMBAL",
    },
    Provider {
        url: "https://www.transportesalentejolitoral.pt/",
        name: "AVEROMAR",
    },
];

async fn process_direction(
    client: &OptWebClient,
    tables: &GtfsTables,
    line: &Line,
    direction: Direction,
    include_header: bool,
    mut trip_ledger: HashSet<String>,
    mut service_ledger: HashSet<String>,
) -> Result<DirectionBatch> {
    info!(
        "processing direction {} for line {}",
        direction.code(),
        line.id
    );

    let calendars = client.get_calendars(&line.id).await?;

    let mut batch = DirectionBatch::default();
    for (calendar_index, calendar) in calendars.iter().enumerate() {
        let pattern = client
            .get_pattern(&line.id, direction, &calendar.schedules)
            .await?;

        let header = include_header && calendar_index == 0;
        let synthesis = pattern_to_gtfs_trips_and_calendar_dates(
            tables,
            TRIP_PREFIX,
            line,
            direction,
            calendar,
            &pattern,
            header,
            &trip_ledger,
            &service_ledger,
        );
        //same ledger state as the trips call, so the two generators agree on
        //which trips are new
        let (stop_times, _) = pattern_to_gtfs_stop_times(
            tables,
            TRIP_PREFIX,
            line,
            direction,
            calendar,
            &pattern,
            header,
            &trip_ledger,
        );

        trip_ledger.extend(synthesis.trip_ids.iter().cloned());
        service_ledger.extend(synthesis.service_ids.iter().cloned());

        batch.trips.push(synthesis.trips);
        batch.calendar_dates.push(synthesis.calendar_dates);
        batch.stop_times.push(stop_times);
        batch.trip_ids.extend(synthesis.trip_ids);
        batch.service_ids.extend(synthesis.service_ids);
    }

    Ok(batch)
}

async fn run_provider(provider: &Provider, tables: &GtfsTables) -> Result<()> {
    let client = OptWebClient::new(provider.url, provider.name);

    info!("fetching lines for {}", provider.name);
    let lines = client.get_lines().await?;

    info!("fetching stops for {}", provider.name);
    let stops = client
        .get_stops_near(STOPS_QUERY_LAT, STOPS_QUERY_LON, STOPS_QUERY_RADIUS)
        .await?;

    let mut ledgers = ProcessedIds::default();
    let mut trips_chunks: Vec<String> = Vec::new();
    let mut stop_times_chunks: Vec<String> = Vec::new();
    let mut calendar_dates_chunks: Vec<String> = Vec::new();

    for line in &lines {
        info!("processing line {} - {}", line.id, line.name);

        let directions: Vec<Direction> = line
            .directions
            .iter()
            .filter_map(|code| {
                let direction = Direction::from_code(code);
                if direction.is_none() {
                    warn!("unknown direction code {:?} on line {}", code, line.id);
                }
                direction
            })
            .collect();

        //all directions of one line in flight at once, each against a ledger
        //snapshot; batches are merged in direction order after the join
        let first_chunk_of_run = trips_chunks.is_empty();
        let batches = join_all(directions.iter().enumerate().map(|(index, &direction)| {
            process_direction(
                &client,
                tables,
                line,
                direction,
                first_chunk_of_run && index == 0,
                ledgers.trip_ids.clone(),
                ledgers.service_ids.clone(),
            )
        }))
        .await;

        for batch in batches {
            merge_direction_batch(
                &mut ledgers,
                batch?,
                &mut trips_chunks,
                &mut stop_times_chunks,
                &mut calendar_dates_chunks,
            );
        }

        tokio::time::sleep(INTER_LINE_DELAY).await;
    }

    let out_dir = Path::new(OUT_DIR).join(provider.name);
    fs::create_dir_all(&out_dir)?;

    fs::write(
        out_dir.join("routes.txt"),
        lines_to_gtfs_routes(tables, &lines, provider.name, ROUTE_TYPE_BUS, "", ""),
    )?;
    fs::write(out_dir.join("stops.txt"), stops_to_gtfs_stops(&stops))?;
    fs::write(out_dir.join("trips.txt"), trips_chunks.join("\n"))?;
    fs::write(out_dir.join("stop_times.txt"), stop_times_chunks.join("\n"))?;
    fs::write(
        out_dir.join("calendar_dates.txt"),
        calendar_dates_chunks.join("\n"),
    )?;

    info!(
        "wrote {} with {} trip chunks, {} stop_time chunks, {} calendar_date chunks",
        out_dir.display(),
        trips_chunks.len(),
        stop_times_chunks.len(),
        calendar_dates_chunks.len()
    );

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let tables_json = fs::read_to_string(TABLES_PATH)
        .map_err(|e| eyre!("unable to read {}: {}", TABLES_PATH, e))?;
    let tables = GtfsTables::from_json(&tables_json)?;

    for provider in &PROVIDERS {
        run_provider(provider, &tables).await?;
    }

    Ok(())
}
