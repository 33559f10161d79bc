mod view;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;

use snapnet::{
    ClientChannel, ClientConfig, LinkState, TickClock, Transport, TransportError, UdpConfig,
    UdpTransport,
};
use view::ArenaView;

#[derive(Parser)]
#[command(name = "snapnet-client")]
#[command(about = "Headless snapnet arena client")]
struct Args {
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value_t = snapnet::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value = "bot")]
    name: String,

    #[arg(short, long, default_value_t = snapnet::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 0, help = "Seconds to stay connected, 0 for no limit")]
    duration: u64,

    #[arg(short, long, help = "Chat line to send once connected")]
    say: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let interrupted = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Runtime::new()?;
    {
        let interrupted = Arc::clone(&interrupted);
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }

    let factory = || -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(UdpTransport::open(UdpConfig::default())?))
    };
    let mut channel = ClientChannel::new(ArenaView::new(&args.name), factory, ClientConfig::default());
    channel.connect(&args.host, args.port)?;

    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let mut clock = TickClock::new(args.tick_rate);
    let mut said = args.say.is_none();
    let mut last_report = Instant::now();

    loop {
        if interrupted.load(Ordering::SeqCst) {
            log::info!("CL: Interrupted");
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }

        let time = clock.wait_next();
        channel.update(&time);

        match channel.state() {
            LinkState::Disconnected => break,
            LinkState::Connecting => continue,
            LinkState::Connected => {}
        }

        if !said && let Some(text) = &args.say {
            channel.send_notification(text)?;
            said = true;
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            let view = channel.game();
            log::info!(
                "CL: Frame {}, {} players, at {:?}, {} snapshots",
                channel.last_frame(),
                view.player_count(),
                view.own_position(),
                view.snapshots_applied
            );
        }
    }

    let standby = channel.is_standby();
    let reason = channel.game().disconnect_reason.clone();
    channel.disconnect();

    if standby {
        let error = channel.game().last_error.clone().unwrap_or_default();
        bail!("connection lost: {error}");
    }
    if let Some(reason) = reason {
        log::info!("CL: Disconnected: {reason}");
    }
    Ok(())
}
