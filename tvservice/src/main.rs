//! tvserviced: runs the service registry against a recorded transport
//! stream, with optional CWC descrambling.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use uuid::Uuid;

use tvservice::config::ConfigFile;
use tvservice::descrambler::{CaClient, CwcClient};
use tvservice::feed::file::FileFeed;
use tvservice::feed::Feed;
use tvservice::logging;
use tvservice::pad::{StopReason, StreamingMessage};
use tvservice::service::{InstanceList, Registry, Subscription, SubscriptionOptions};

/// tvserviced - TV service registry and descrambling daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Transport stream file to play out
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Write the descrambled transport stream of the first service here
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Loop the input file
    #[arg(long)]
    repeat: bool,

    /// Seconds between status reports
    #[arg(long, default_value = "30")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match ConfigFile::locate(args.config.as_deref()) {
        Some(path) => {
            let c = ConfigFile::load(&path)?;
            eprintln!("Loaded config from: {}", path.display());
            c
        }
        None => ConfigFile::default(),
    };

    let log_dir = args.log_dir.clone().unwrap_or_else(|| file_config.logging.log_dir.clone());
    let _log_guard = logging::init_logging(
        &log_dir,
        file_config.logging.retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    info!("tvserviced starting...");

    let cwc = if file_config.cwc.servers.is_empty() {
        info!("  No card servers configured, descrambling disabled");
        None
    } else {
        let cwc_config = file_config.cwc.to_cwc_config();
        for server in &cwc_config.servers {
            info!("  Card server: {}", server.address);
        }
        Some(CwcClient::new(cwc_config)?)
    };
    let ca: Option<Arc<dyn CaClient>> = cwc.clone().map(|c| c as Arc<dyn CaClient>);

    let registry = Registry::init(file_config.registry.to_registry_config(), ca);

    let Some(input) = args.input.clone() else {
        error!("No input given (--input)");
        return Err("no input".into());
    };
    let mut feed = FileFeed::new(&input)
        .with_repeat(args.repeat)
        .with_grace_period(file_config.registry.grace_period());
    if let Some(dir) = &file_config.registry.settings_dir {
        std::fs::create_dir_all(dir)?;
        feed = feed.with_settings_dir(dir);
    }
    let feed = Arc::new(feed);
    info!("  Input: {}", input.display());

    let mut services = Vec::new();
    for mut settings in file_config.services {
        let uuid = *settings.uuid.get_or_insert_with(Uuid::new_v4);
        if let Some(saved) = feed.load_settings(uuid) {
            info!("  Restored settings for {}", uuid);
            settings = saved;
        }
        let service = registry.create(feed.clone() as Arc<dyn Feed>, &settings);
        info!("  Service: {} ({})", service.nicename(), uuid);
        services.push(service);
    }
    if services.is_empty() {
        warn!("No [[service]] entries configured, nothing to do");
        registry.shutdown();
        return Ok(());
    }

    let mut drains = Vec::new();
    for (i, service) in services.iter().enumerate() {
        let passthrough = i == 0 && args.output.is_some();
        let subscription = match registry.add_subscriber(
            service,
            "tvserviced",
            SubscriptionOptions {
                weight: 100,
                passthrough,
                queue_len: None,
            },
        ) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to subscribe to {}: {}", service.nicename(), e);
                continue;
            }
        };

        let mut candidates = InstanceList::new();
        let instance = match registry.find_instance(Some(service), None, &mut candidates, 100) {
            Ok(chosen) => chosen.instance.clone(),
            Err(e) => {
                error!("{}: {}", service.nicename(), e);
                registry.remove_subscriber(subscription, StopReason::NoServiceAvailable);
                continue;
            }
        };

        let output = if passthrough { args.output.clone() } else { None };
        let registry_for_wait = registry.clone();
        let service_for_wait = service.clone();
        drains.push(tokio::task::spawn_blocking(move || {
            let status =
                registry_for_wait.wait_for_instance(&mut candidates, &service_for_wait, &instance);
            info!("{}: {}", service_for_wait.nicename(), status.text());
            drain(subscription, output)
        }));
    }

    let mut housekeeping = tokio::time::interval(Duration::from_secs(1));
    let mut report = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = housekeeping.tick() => {
                let registry = registry.clone();
                tokio::task::spawn_blocking(move || registry.process_deferred()).await?;
            }
            _ = report.tick() => {
                match serde_json::to_string(&registry.snapshot()) {
                    Ok(json) => info!("services: {}", json),
                    Err(e) => warn!("Failed to serialize status: {}", e),
                }
                if let Some(cwc) = &cwc {
                    if let Ok(json) = serde_json::to_string(&cwc.status()) {
                        info!("cwc: {}", json);
                    }
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    {
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || registry.shutdown()).await?;
    }
    for handle in drains {
        match handle.await {
            Ok(Ok(bytes)) if bytes > 0 => info!("Wrote {} bytes", bytes),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Output failed: {}", e),
            Err(e) => error!("Drain task failed: {}", e),
        }
    }
    if let Some(cwc) = cwc {
        cwc.shutdown();
    }
    info!("tvserviced stopped");
    Ok(())
}

/// Consume a subscription until its service stops, writing passthrough TS
/// to `output`. Returns the number of bytes written.
fn drain(subscription: Subscription, output: Option<PathBuf>) -> std::io::Result<u64> {
    let mut writer = match output {
        Some(path) => Some(BufWriter::new(File::create(path)?)),
        None => None,
    };
    let mut written = 0u64;
    loop {
        match subscription.recv_timeout(Duration::from_millis(500)) {
            Some(StreamingMessage::Mpegts(data)) => {
                if let Some(w) = writer.as_mut() {
                    w.write_all(&data)?;
                    written += data.len() as u64;
                }
            }
            Some(StreamingMessage::Start(start)) => {
                info!("{}: {} component(s)", start.service, start.components.len());
            }
            Some(StreamingMessage::ServiceStatus(status)) => {
                info!("status: {}", status.text());
            }
            Some(StreamingMessage::Stop(reason)) | Some(StreamingMessage::NoStart(reason)) => {
                info!("stream stopped: {:?}", reason);
                break;
            }
            Some(StreamingMessage::Packet(_)) => {}
            None => {
                if subscription.queue().is_closed() {
                    break;
                }
            }
        }
    }
    if let Some(mut w) = writer {
        w.flush()?;
    }
    Ok(written)
}
