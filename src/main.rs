use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_env("LPM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    std::process::exit(lpm::cli::run());
}
