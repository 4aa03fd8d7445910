use std::io::Write;

/// Initialize `env_logger` with the `time - LEVEL - message` format.
///
/// `RUST_LOG` takes precedence over `level`. Safe to call more than once.
pub fn init_logging(level: log::LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    let _ = builder.try_init();
}
