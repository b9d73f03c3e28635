//! Egress side of the tunnel: opens outbound TCP connections to the targets
//! named by incoming frames.

use argh::FromArgs;
use std::process;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;
use uart_tunnel::{Link, egress};

/// Tunnel TCP sessions over a serial link (egress side).
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
}

#[tokio::main]
async fn main() {
    let args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(uart_tunnel::log_level_from_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

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

    process::exit(egress::run(link).await);
}
