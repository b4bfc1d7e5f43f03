use hybrid_trips::app::admin::{AdminCommand, AdminOutput};
use hybrid_trips::domain::models::TripRecord;

fn main() {
    if let Err(error) = run() {
        eprintln!("admin command failed: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut command = None;
    let mut db_path = None;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--sweep" => {
                command = Some(AdminCommand::Sweep);
                index += 1;
            }
            "--recompute" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--recompute requires a trip id".to_string());
                };
                command = Some(AdminCommand::Recompute {
                    trip_id: value.clone(),
                });
                index += 2;
            }
            "--delete" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--delete requires a trip id".to_string());
                };
                command = Some(AdminCommand::Delete {
                    trip_id: value.clone(),
                });
                index += 2;
            }
            "--list" => {
                let limit = match args.get(index + 1) {
                    Some(value) if !value.starts_with("--") => {
                        index += 1;
                        value
                            .parse::<u32>()
                            .map_err(|_| format!("invalid --list limit: {value}"))?
                    }
                    _ => 20,
                };
                command = Some(AdminCommand::ListTrips { limit });
                index += 1;
            }
            "--db" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--db requires a path".to_string());
                };
                db_path = Some(value.clone());
                index += 2;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    let Some(command) = command else {
        print_help();
        return Err("no command given".to_string());
    };

    let output = hybrid_trips::app::run_admin(command, db_path).map_err(|error| error.to_string())?;
    print_output(&output);
    Ok(())
}

fn print_output(output: &AdminOutput) {
    match output {
        AdminOutput::Swept(report) => {
            println!(
                "sweep: {} stale, {} finalized, {} already closed, {} failed, charging closed: {}",
                report.stale_trips,
                report.finalized,
                report.already_closed,
                report.failed,
                report.charging_closed
            );
        }
        AdminOutput::Recomputed(trip) => print_trip(trip),
        AdminOutput::Deleted { trip_id, existed } => {
            if *existed {
                println!("deleted trip {trip_id}");
            } else {
                println!("trip {trip_id} did not exist");
            }
        }
        AdminOutput::Trips(trips) => {
            for trip in trips {
                print_trip(trip);
            }
        }
    }
}

fn print_trip(trip: &TripRecord) {
    println!(
        "{} session={} {} -> {} closed={} distance_mi={} mpg={} kwh_per_mile={}",
        trip.id,
        trip.session_key,
        trip.start_time,
        trip.end_time,
        trip.is_closed,
        format_optional(trip.distance_mi),
        format_optional(trip.mpg),
        format_optional(trip.kwh_per_mile)
    );
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |value| format!("{value:.2}"))
}

fn print_help() {
    println!("trips_admin");
    println!();
    println!("Usage:");
    println!("  cargo run --bin trips_admin -- <command> [--db <file>]");
    println!();
    println!("Commands:");
    println!("  --sweep              finalize idle trips and close idle charging once");
    println!("  --recompute <id>     re-derive statistics of a closed trip");
    println!("  --delete <id>        delete a trip and its samples");
    println!("  --list [limit]       list the most recent trips (default 20)");
    println!();
    println!("Options:");
    println!("  --db <file>          database path (default: DB_PATH)");
}
