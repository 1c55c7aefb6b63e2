use clap::{
    builder::{
        styling::{AnsiColor, Effects, Styles},
        ValueParser,
    },
    Arg, ColorChoice, Command,
};

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            // Successfully parsed as a number
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::api::GIT_COMMIT_HASH)
            .into_boxed_str(),
    );

    Command::new("folio")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("FOLIO_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .long_help(
                    "PostgreSQL connection string. Without it accounts and sessions live in memory and are lost on restart.",
                )
                .env("FOLIO_DSN")
                .hide_env_values(true),
        )
        .arg(
            Arg::new("exchange-secret")
                .long("exchange-secret")
                .help("Shared secret the identity exchange sends with each callback")
                .long_help(
                    "Shared secret the identity exchange sends in the x-folio-exchange-token header. Without it provider callbacks are refused.",
                )
                .env("FOLIO_EXCHANGE_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new("catalog")
                .short('c')
                .long("catalog")
                .help("JSON file with the section tree")
                .env("FOLIO_CATALOG"),
        )
        .arg(
            Arg::new("session-ttl-seconds")
                .long("session-ttl-seconds")
                .help("Session lifetime in seconds")
                .default_value("43200")
                .env("FOLIO_SESSION_TTL_SECONDS")
                .value_parser(clap::value_parser!(u32).range(60..)),
        )
        .arg(
            Arg::new("default-preview-length")
                .long("default-preview-length")
                .help("Preview length for sections that do not set one")
                .default_value("300")
                .env("FOLIO_DEFAULT_PREVIEW_LENGTH")
                .value_parser(clap::value_parser!(u32).range(4..)),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("FOLIO_LOG_LEVEL")
                .global(true)
                .action(clap::ArgAction::Count)
                .value_parser(validator_log_level()),
        )
}
