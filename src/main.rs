use anyhow::Context;
use arm_controller::domain::settings::SettingsService;
use arm_controller::infrastructure::logging::init_logger;
use arm_controller::infrastructure::storage::ActionRepository;
use arm_controller::ArmControllerApp;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "arm_controller", version, about = "Six-axis servo arm controller")]
struct Cli {
    /// Settings file (defaults to the user config directory).
    #[arg(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Project database (overrides the settings file).
    #[arg(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored projects.
    Projects,
    /// Probe a /24 subnet for WiFi arms.
    ScanWifi {
        /// First two octets, e.g. 192.168
        #[arg(long, default_value = "192.168")]
        base: String,
        /// Third octet.
        #[arg(long, default_value_t = 1)]
        subnet: u8,
    },
    /// Scan for BLE arms.
    ScanBle,
    /// Play a stored project on an arm.
    Play {
        /// Project id (see `projects`).
        project: i64,
        /// Repeat until interrupted.
        #[arg(long = "loop", default_value_t = false)]
        looping: bool,
        #[command(flatten)]
        target: Target,
    },
    /// Enable servo output.
    Arm {
        #[command(flatten)]
        target: Target,
    },
    /// Disable servo output.
    Disarm {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args, Debug)]
struct Target {
    /// WiFi arm host name or IP.
    #[arg(long, value_name = "HOST", conflicts_with_all = ["serial", "ble"])]
    wifi: Option<String>,
    /// WebSocket port for --wifi.
    #[arg(long, requires = "wifi")]
    port: Option<u16>,
    /// Serial device bound to a classic Bluetooth module.
    #[arg(long, value_name = "PORT", requires = "address", conflicts_with = "ble")]
    serial: Option<String>,
    /// MAC address of the module behind --serial.
    #[arg(long, value_name = "MAC")]
    address: Option<String>,
    /// MAC address of a BLE arm.
    #[arg(long, value_name = "MAC")]
    ble: Option<String>,
}

async fn connect_target(app: &ArmControllerApp, target: &Target) -> anyhow::Result<()> {
    let connected = if let Some(host) = &target.wifi {
        app.connect_wifi(host, target.port).await
    } else if let (Some(port), Some(address)) = (&target.serial, &target.address) {
        app.connect_serial(port, address, None).await
    } else if let Some(address) = &target.ble {
        app.connect_ble(address).await
    } else {
        anyhow::bail!("no device given, use --wifi, --serial with --address, or --ble");
    };

    if !connected {
        anyhow::bail!("failed to connect to device");
    }
    info!(
        device = %app.connected_device_name().unwrap_or_default(),
        "Connected"
    );
    Ok(())
}

async fn play(app: &ArmControllerApp, project_id: i64, looping: bool) -> anyhow::Result<()> {
    if !app.open_project(project_id).await? {
        anyhow::bail!("project {} not found", project_id);
    }

    let sequencer = app.sequencer();
    let mut playing = sequencer.subscribe_playing();
    sequencer.play(looping);

    tokio::select! {
        result = playing.wait_for(|playing| !*playing) => {
            result.context("sequencer dropped")?;
            info!("Playback complete");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping playback");
            sequencer.stop();
        }
    }
    Ok(())
}

async fn run(cli: Cli, app: &ArmControllerApp) -> anyhow::Result<()> {
    match cli.command {
        Command::Projects => {
            let projects = app.repository().list_projects().await?;
            if projects.is_empty() {
                println!("No projects");
            }
            for p in projects {
                let slot = p.remote_slot_id.map(|s| s.to_string()).unwrap_or_default();
                println!(
                    "{:>4}  {:<50}  {:>3} frames  {:>7} ms  slot {}",
                    p.id, p.name, p.frame_count, p.total_duration_ms, slot
                );
            }
        }
        Command::ScanWifi { base, subnet } => {
            for host in app.scan_wifi(&base, subnet).await {
                println!("{}", host);
            }
        }
        Command::ScanBle => {
            for device in app.scan_ble().await? {
                let rssi = device
                    .signal_strength
                    .map(|r| format!("{} dBm", r))
                    .unwrap_or_default();
                println!("{}  {:<24}  {}", device.address, device.name, rssi);
            }
        }
        Command::Play {
            project,
            looping,
            target,
        } => {
            connect_target(app, &target).await?;
            play(app, project, looping).await?;
        }
        Command::Arm { target } => {
            connect_target(app, &target).await?;
            if !app.arm_robot().await {
                anyhow::bail!("ARM command was not delivered");
            }
        }
        Command::Disarm { target } => {
            connect_target(app, &target).await?;
            if !app.emergency_stop().await {
                anyhow::bail!("DISARM command was not delivered");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => SettingsService::with_path(path),
        None => SettingsService::new()?,
    };

    // Keep the guard alive so file logs are flushed on exit
    let _logging_guard = init_logger(&settings.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting arm controller");

    let database_path = match &cli.database {
        Some(path) => path.clone(),
        None => settings.get().database_path()?,
    };
    let repository = ActionRepository::open(&database_path)
        .await
        .with_context(|| format!("failed to open {}", database_path.display()))?;

    let (app, _events) = ArmControllerApp::new(settings, repository.clone());
    let result = run(cli, &app).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }

    app.shutdown().await;
    repository.close().await;
    result
}
