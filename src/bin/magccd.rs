//! magccd - command line client for the Magellan CCD controller server
//!
//! Usage:
//!   cargo run --bin magccd -- echo "hello"
//!   cargo run --bin magccd -- get ExposureTimeRemaining
//!   cargo run --bin magccd -- set ExposureTime 5000
//!   cargo run --bin magccd -- load 2 tim.lod
//!   cargo run --bin magccd -- discover --name guider_z1
//!   cargo run --bin magccd -- --demo get CCDTemp

use std::path::Path;

use anyhow::{bail, Context};
use clap::Parser;
use magccd_rs::camserver::{CameraServerClient, Reply};
use magccd_rs::common::cli::{MagccdArgs, MagccdCommand};
use magccd_rs::common::ErrorStatus;
use magccd_rs::config::Config;
use magccd_rs::controller::MagController;
use magccd_rs::discovery::{Discovery, NO_ADDRESS};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("magccd_rs=info".parse()?))
        .init();

    let args = MagccdArgs::parse();

    let config_path = &args.common.config_file;
    let mut config = if Path::new(config_path).exists() {
        Config::load(config_path).with_context(|| format!("loading {}", config_path))?
    } else {
        info!(path = %config_path, "Config file not found, using defaults");
        Config::default()
    };
    args.common.apply(&mut config);

    let discovery = Discovery::new(config.discovery.clone());

    if let MagccdCommand::Discover { name } = &args.command {
        match name {
            Some(name) => println!("{}", discovery.resolve(name).await?),
            None => {
                for reply in discovery.list_all().await? {
                    let payload = String::from_utf8_lossy(&reply.payload);
                    println!("{}  {}", reply.sender, payload.trim_end());
                }
            }
        }
        return Ok(());
    }

    // Resolve the controller server by name unless given explicitly
    if args.common.host.is_none() && !config.camserver.demo {
        if let Some(name) = config.discovery.controller_name.clone() {
            let address = discovery.resolve(&name).await?;
            if address == NO_ADDRESS {
                warn!(name = %name, host = %config.camserver.host, "Discovery failed, using configured host");
            } else {
                config.camserver.host = address;
            }
        }
    }

    let client = CameraServerClient::new(config.camserver.clone(), ErrorStatus::new());
    let controller = MagController::new(client);

    let reply = match args.command {
        MagccdCommand::Echo { message } => {
            let mut server = controller.server().lock().await;
            match message {
                Some(message) => server.echo(&message).await?,
                None => server.test().await?,
            }
        }
        MagccdCommand::Get { name } => controller.server().lock().await.get_parameter(&name).await?,
        MagccdCommand::Set { name, value } => {
            controller
                .server()
                .lock()
                .await
                .set_parameter(&name, &value)
                .await?
        }
        MagccdCommand::Load { board, file } => {
            let code = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            controller.load_dsp_code(board, &code).await?;
            println!("Loaded {} into board {}", file.display(), board);
            return Ok(());
        }
        MagccdCommand::Close => controller.server().lock().await.close_server().await?,
        MagccdCommand::Restart => controller.server().lock().await.restart_server().await?,
        MagccdCommand::Reset => controller.server().lock().await.reset_server().await?,
        MagccdCommand::Discover { .. } => return Ok(()),
    };

    report(&reply)
}

fn report(reply: &Reply) -> anyhow::Result<()> {
    match reply {
        Reply::Ok(_) => {
            println!("{}", reply);
            Ok(())
        }
        Reply::Error { message } => bail!("controller server error: {}", message),
    }
}
