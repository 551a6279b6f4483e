use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dualcam_core::{FrameLayout, FusionType, GainStatus, Plane, Resolution, Resolutions};
use std::fmt::Write as _;

const BUS_NAME: &str = "org.freedesktop.DualCam1";
const OBJECT_PATH: &str = "/org/freedesktop/DualCam1";
const INTERFACE: &str = "org.freedesktop.DualCam1";

#[derive(Parser)]
#[command(name = "dualcam", about = "Dual-sensor camera CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the composite frame layout for a set of resolutions
    Layout {
        /// Resolution used for every plane group (e.g. 256x192)
        #[arg(default_value = "256x192")]
        resolution: Resolution,
        /// Override the sensor (raw IR and temperature) resolution
        #[arg(long)]
        sensor: Option<Resolution>,
        /// Override the visible resolution
        #[arg(long)]
        visible: Option<Resolution>,
        /// Override the dual (fused) resolution
        #[arg(long)]
        dual: Option<Resolution>,
    },
    /// List devices known to the hardware quirk database
    Quirks,
    /// List V4L2 capture devices
    Devices,
    /// Show daemon status
    Status,
    /// Select the fusion type
    Fusion {
        /// fusion-only, ir-only, ir-only-no-fusion or custom
        kind: FusionType,
    },
    /// Toggle brightness amplification of the fused image
    Amplify {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Force the sensor gain
    Gain {
        /// high or low
        status: GainStatus,
    },
    /// Start preview
    Start,
    /// Stop preview
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Layout {
            resolution,
            sensor,
            visible,
            dual,
        } => {
            let layout = FrameLayout::new(Resolutions::new(
                sensor.unwrap_or(resolution),
                visible.unwrap_or(resolution),
                dual.unwrap_or(resolution),
            ));
            print!("{}", render_layout(&layout));
        }
        Commands::Quirks => {
            for quirk in dualcam_hw::quirks::list_quirks() {
                println!(
                    "{}  {:<8} {}x{}@{} {:<4}  ir-commands: {}  {}",
                    quirk.usb_id(),
                    format!("{:?}", quirk.device.role).to_lowercase(),
                    quirk.stream.width,
                    quirk.stream.height,
                    quirk.stream.fps,
                    quirk.stream.fourcc,
                    if quirk.commands.is_some() { "yes" } else { "no" },
                    quirk.device.name
                );
            }
        }
        Commands::Devices => {
            let devices = dualcam_hw::camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                let usb = dev.usb.map(|id| id.to_string()).unwrap_or_else(|| "-".into());
                let known = dev
                    .usb
                    .and_then(dualcam_hw::quirks::lookup_quirk)
                    .map(|q| q.device.name.as_str())
                    .unwrap_or("");
                println!("{:<12} {}  {} ({}) {}", dev.path, usb, dev.name, dev.driver, known);
            }
        }
        Commands::Status => {
            let conn = connect(cli.session).await?;
            let json: String = call(&conn, "Status", &()).await?;
            let value: serde_json::Value = serde_json::from_str(&json)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Fusion { kind } => {
            let conn = connect(cli.session).await?;
            let () = call(&conn, "SetFusionType", &(kind.name(),)).await?;
            println!("Fusion type set to {kind}");
        }
        Commands::Amplify { state } => {
            let enabled = matches!(state, Toggle::On);
            let conn = connect(cli.session).await?;
            let () = call(&conn, "SetAmplification", &(enabled,)).await?;
            println!("Amplification {}", if enabled { "on" } else { "off" });
        }
        Commands::Gain { status } => {
            let conn = connect(cli.session).await?;
            let () = call(&conn, "SetGainStatus", &(status.to_string(),)).await?;
            println!("Gain set to {status}");
        }
        Commands::Start => {
            let conn = connect(cli.session).await?;
            let () = call(&conn, "StartPreview", &()).await?;
            println!("Preview started");
        }
        Commands::Stop => {
            let conn = connect(cli.session).await?;
            let () = call(&conn, "StopPreview", &()).await?;
            println!("Preview stopped");
        }
    }

    Ok(())
}

async fn connect(session: bool) -> Result<zbus::Connection> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    };
    conn.context("failed to connect to D-Bus")
}

async fn call<B, R>(conn: &zbus::Connection, method: &str, body: &B) -> Result<R>
where
    B: serde::ser::Serialize + zbus::zvariant::DynamicType,
    R: for<'d> zbus::zvariant::DynamicDeserialize<'d>,
{
    tracing::debug!(method, "calling dualcamd");
    let reply = conn
        .call_method(Some(BUS_NAME), OBJECT_PATH, Some(INTERFACE), method, body)
        .await
        .with_context(|| format!("{method} failed; is dualcamd running?"))?;
    Ok(reply.body().deserialize()?)
}

/// Plane table plus the total frame length.
fn render_layout(layout: &FrameLayout) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<22} {:>9} {:>10} {:>10}", "plane", "res", "offset", "bytes");
    for plane in Plane::ALL {
        let span = layout.span(plane);
        let _ = writeln!(
            out,
            "{:<22} {:>9} {:>10} {:>10}",
            plane.name(),
            layout.plane_resolution(plane).to_string(),
            span.offset,
            span.len
        );
    }
    let _ = writeln!(out, "frame length: {} bytes", layout.frame_len());
    out
}
