use clap::{Arg, ArgMatches, Command};

/// Build the command line definition.
pub fn build_command() -> Command {
    Command::new("mbt")
        .about("Production test station for Monoberry boards")
        .arg(
            Arg::new("server-endpoint")
                .help("Base URL of the provisioning server")
                .value_name("SERVER_ENDPOINT")
                .index(1),
        )
        .arg(
            Arg::new("serial-port")
                .help("Path to the UART device of the board under test")
                .value_name("SERIAL_PORT")
                .index(2),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Station configuration file (TOML)")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("baud-rate")
                .long("baud-rate")
                .help("UART baud rate (overrides the config file)")
                .value_name("BAUD")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .help("Directory for per-run log files")
                .value_name("DIR"),
        )
        .arg(
            Arg::new("list-ports")
                .long("list-ports")
                .short('l')
                .help("List all available serial ports and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .short('j')
                .help("Print station events as JSON lines")
                .action(clap::ArgAction::SetTrue),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}
