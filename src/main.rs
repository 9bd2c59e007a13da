use anyhow::{anyhow, Result};

use mbt::{boot, cli, config::StationConfig, console, core::spawn_station, protocol::ports};

fn main() -> Result<()> {
    boot::init_logger();
    let matches = cli::parse_args();
    let json = matches.get_flag("json");

    if matches.get_flag("list-ports") {
        let ports = ports::available_ports();
        if json {
            println!("{}", serde_json::to_string_pretty(&ports)?);
        } else {
            for port in ports {
                match port.usb_id {
                    Some(id) => println!("{} ({}, {id})", port.name, port.kind),
                    None => println!("{} ({})", port.name, port.kind),
                }
            }
        }
        return Ok(());
    }

    let config = StationConfig::from_matches(&matches)?;
    log::info!(
        "Station using {} on {} @ {} baud",
        config.server_endpoint,
        config.serial.port,
        config.serial.baud_rate
    );

    let (bus, core_handle) = spawn_station(&config)?;
    console::run_console(bus, json)?;

    core_handle
        .join()
        .map_err(|_| anyhow!("Core thread panicked"))?
}
