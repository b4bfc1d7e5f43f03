fn main() {
    if let Err(err) = hybrid_trips::app::run_service() {
        eprintln!("service startup failed: {err}");
        std::process::exit(1);
    }
}
