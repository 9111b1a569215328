use tracing::level_filters::LevelFilter;

/// Map the `-v` level (0 errors .. 3 debug) to a tracing filter.
fn filter_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

pub fn init(verbosity: u8) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(filter_for(verbosity))
        .with_ansi(false)
        .with_target(false)
        .try_init();
}
