use std::{path::PathBuf, time::Duration};

use clap::Parser;
use ipnet::Ipv4Net;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use vipgate::{
    scheduler::{self, MappingDirs, Mode},
    settings, Reconciler, Settings,
};
use vipgate_config::LogFormat;
use vipgate_kernel::shell::ShellBackend;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Opt {
    /// Remove every managed rule, route and table, then exit
    #[arg(long)]
    delete: bool,

    /// Interface the VIPs are bound to
    #[arg(long, env = "VIPGATE_INTERFACE", default_value = settings::DEFAULT_INTERFACE)]
    interface: String,

    #[arg(long, env = "VIPGATE_POD_SUBNET", default_value = settings::DEFAULT_POD_SUBNET)]
    pod_subnet: Ipv4Net,

    #[arg(long, env = "VIPGATE_SERVICE_SUBNET", default_value = settings::DEFAULT_SERVICE_SUBNET)]
    service_subnet: Ipv4Net,

    /// Directory with one file per VIP holding its route id
    #[arg(
        long,
        env = "VIPGATE_VIP_ROUTEID_MAPPINGS",
        default_value = "/etc/vipgate/vip-routeid-mappings"
    )]
    vip_routeid_mappings: PathBuf,

    /// Directory with one file per pod IP holding its VIP
    #[arg(
        long,
        env = "VIPGATE_PODIP_VIP_MAPPINGS",
        default_value = "/etc/vipgate/podip-vip-mappings"
    )]
    podip_vip_mappings: PathBuf,

    /// Reconcile on this interval (e.g. `30s`) instead of once
    #[arg(long, env = "VIPGATE_UPDATE_INTERVAL", value_parser = humantime::parse_duration)]
    update_interval: Option<Duration>,

    #[arg(long, env = "VIPGATE_CHAIN", default_value = settings::DEFAULT_CHAIN)]
    chain: String,

    #[arg(long, env = "VIPGATE_ROUTE_TABLE_PREFIX", default_value = settings::DEFAULT_ROUTE_TABLE_PREFIX)]
    route_table_prefix: String,

    /// Where route table names are registered
    #[arg(long, env = "VIPGATE_RT_TABLES_DIR", default_value = "/etc/iproute2/rt_tables.d")]
    rt_tables_dir: PathBuf,

    #[arg(long, env = "VIPGATE_IP", default_value = "ip")]
    ip: String,

    #[arg(long, env = "VIPGATE_LOG_LEVEL", default_value_t = Level::INFO)]
    log_level: Level,

    /// `text` or `json`
    #[arg(long, env = "VIPGATE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Write daily log files here instead of stdout
    #[arg(long, env = "VIPGATE_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

impl Opt {
    fn mode(&self) -> Mode {
        match (self.delete, self.update_interval) {
            (true, _) => Mode::Delete,
            (false, Some(interval)) => Mode::Periodic(interval),
            (false, None) => Mode::Once,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    let _guard = match &opt.log_dir {
        Some(dir) => Some(vipgate_config::setup_tracing_to_file(
            dir,
            "vipgate.log",
            opt.log_level,
            opt.log_format,
        )?),
        None => {
            vipgate_config::setup_tracing_to_stdout(opt.log_level, opt.log_format)?;
            None
        }
    };

    let mode = opt.mode();
    info!(?mode, interface = %opt.interface, "starting vipgate");

    let backend = ShellBackend::new(&opt.rt_tables_dir)?.ip_program(&opt.ip);
    let settings = Settings::new(&opt.interface, opt.pod_subnet, opt.service_subnet)
        .chain(&opt.chain)
        .route_table_prefix(&opt.route_table_prefix);
    let dirs = MappingDirs {
        workload_to_vip: opt.podip_vip_mappings,
        vip_to_route_id: opt.vip_routeid_mappings,
    };

    let cancel = CancellationToken::new();
    let signals = scheduler::watch_signals(mode, &cancel)?;

    scheduler::run(Reconciler::new(backend, settings), dirs, mode, cancel).await?;
    if let Some(signals) = signals {
        signals.abort();
    }

    info!("exiting");
    Ok(())
}
