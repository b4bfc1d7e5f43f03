use std::path::{Path, PathBuf};
use std::time::Duration;

use hybrid_trips::adapters::db::{
    LATEST_SCHEMA_VERSION, count_log_events, count_trips, open_connection, run_migrations,
    schema_version,
};

const BUSY_TIMEOUT: Duration = Duration::from_millis(2000);
const TEMPLATE_PATH_ENV: &str = "TEST_DB_TEMPLATE_PATH";
const WAL_SIDECAR_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

#[derive(Debug)]
struct Options {
    path: PathBuf,
    force: bool,
    check_only: bool,
}

fn main() {
    match parse_args(std::env::args().skip(1)) {
        Ok(Some(options)) => {
            if let Err(error) = prepare_template(&options) {
                eprintln!("trips test template not ready: {error}");
                std::process::exit(1);
            }
        }
        Ok(None) => print_help(),
        Err(error) => {
            eprintln!("{error}");
            eprintln!();
            print_help();
            std::process::exit(2);
        }
    }
}

/// `Ok(None)` means help was requested.
fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<Options>, String> {
    let mut options = Options {
        path: default_template_path(),
        force: false,
        check_only: false,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--path" => {
                options.path = args
                    .next()
                    .map(PathBuf::from)
                    .ok_or("--path requires a file")?;
            }
            "--force" => options.force = true,
            "--check" => options.check_only = true,
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    if options.force && options.check_only {
        return Err("--force and --check cannot be combined".to_string());
    }

    Ok(Some(options))
}

/// Same lookup the test suite uses, so both agree on which file is copied.
fn default_template_path() -> PathBuf {
    std::env::var(TEMPLATE_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new("data").join("trips_test.db"))
}

fn prepare_template(options: &Options) -> Result<(), String> {
    let path = options.path.as_path();

    if options.check_only && !path.exists() {
        return Err(format!("{} does not exist", path.display()));
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("cannot create {}: {error}", parent.display()))?;
    }

    if options.force {
        remove_database_files(path)?;
    }

    let mut connection = open_connection(&path.to_string_lossy(), BUSY_TIMEOUT)
        .map_err(|error| error.to_string())?;

    if !options.check_only {
        run_migrations(&mut connection).map_err(|error| error.to_string())?;
    }

    let version = schema_version(&connection).map_err(|error| error.to_string())?;
    if version != LATEST_SCHEMA_VERSION {
        return Err(format!(
            "schema version {version}, expected {LATEST_SCHEMA_VERSION}; rerun without --check"
        ));
    }

    // Tests assert absolute row counts on their copies.
    let trips = count_trips(&connection).map_err(|error| error.to_string())?;
    let log_events = count_log_events(&connection).map_err(|error| error.to_string())?;
    if trips > 0 || log_events > 0 {
        return Err(format!(
            "template holds {trips} trips and {log_events} log events; recreate it with --force"
        ));
    }

    println!(
        "trips test template {} at {} (schema v{version})",
        if options.check_only { "verified" } else { "ready" },
        path.display()
    );
    Ok(())
}

/// WAL mode leaves sidecar files next to the database; a stale `-wal` would
/// be replayed into the fresh file.
fn remove_database_files(path: &Path) -> Result<(), String> {
    let mut targets = vec![path.to_path_buf()];
    for suffix in WAL_SIDECAR_SUFFIXES {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        targets.push(PathBuf::from(sidecar));
    }

    for target in targets.iter().filter(|target| target.exists()) {
        std::fs::remove_file(target)
            .map_err(|error| format!("cannot remove {}: {error}", target.display()))?;
    }

    Ok(())
}

fn print_help() {
    println!("create_test_db");
    println!();
    println!("Prepares the empty, migrated trips database that tests copy per case.");
    println!();
    println!("Usage:");
    println!("  cargo run --bin create_test_db -- [--path <file>] [--force | --check]");
    println!();
    println!("Options:");
    println!("  --path <file>   template file (default: ${TEMPLATE_PATH_ENV} or data/trips_test.db)");
    println!("  --force         delete the file and its -wal/-shm sidecars first");
    println!("  --check         verify schema and emptiness without migrating");
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{parse_args, remove_database_files};

    fn args(values: &[&str]) -> impl Iterator<Item = String> {
        values
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn parses_path_and_force() {
        let options = parse_args(args(&["--path", "tmp/t.db", "--force"]))
            .expect("args should parse")
            .expect("options expected");

        assert_eq!(options.path, PathBuf::from("tmp/t.db"));
        assert!(options.force);
        assert!(!options.check_only);
    }

    #[test]
    fn rejects_force_with_check_and_missing_path_value() {
        assert_eq!(
            parse_args(args(&["--force", "--check"])).unwrap_err(),
            "--force and --check cannot be combined"
        );
        assert_eq!(
            parse_args(args(&["--path"])).unwrap_err(),
            "--path requires a file"
        );
        assert!(parse_args(args(&["--help"])).expect("help parses").is_none());
    }

    #[test]
    fn force_removes_wal_sidecars() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let db = dir.path().join("trips_test.db");
        for name in ["trips_test.db", "trips_test.db-wal", "trips_test.db-shm"] {
            std::fs::write(dir.path().join(name), b"x").expect("file should be written");
        }

        remove_database_files(&db).expect("removal should succeed");

        assert_eq!(
            std::fs::read_dir(dir.path())
                .expect("dir should be readable")
                .count(),
            0
        );
    }
}
