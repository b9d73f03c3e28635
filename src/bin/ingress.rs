//! Ingress side of the tunnel: accepts TCP clients on the mapped local
//! ports and multiplexes them over the serial link.

use argh::FromArgs;
use std::path::Path;
use std::process;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;
use uart_tunnel::{Link, MappingTable, ingress};

/// Tunnel TCP sessions over a serial link (ingress side).
#[derive(FromArgs)]
struct CliArgs {
    /// serial device path (default: COM1)
    #[argh(positional, default = "String::from(\"COM1\")")]
    device: String,

    /// baud rate (default: 115200)
    #[argh(positional, default = "115200")]
    baud: u32,

    /// hardware flow control; pass "false" to disable (default: on)
    #[argh(positional, default = "String::from(\"true\")")]
    flow_control: String,

    /// port mapping file (default: port-mapping.json)
    #[argh(positional, default = "String::from(\"port-mapping.json\")")]
    mapping_file: String,
}

#[tokio::main]
async fn main() {
    let args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(uart_tunnel::log_level_from_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mappings = match MappingTable::load(Path::new(&args.mapping_file)) {
        Ok(mappings) => mappings,
        Err(e) => {
            error!("invalid mapping file {}: {e}", args.mapping_file);
            process::exit(1);
        }
    };

    let hardware_flow = args.flow_control != "false";
    let link = match Link::open_serial(&args.device, args.baud, hardware_flow) {
        Ok(link) => link,
        Err(e) => {
            error!("could not open serial device {}: {e}", args.device);
            process::exit(1);
        }
    };
    info!(
        device = %args.device,
        baud = args.baud,
        hardware_flow,
        "serial link up"
    );

    process::exit(ingress::run(link, &mappings).await);
}
