use anyhow::Result;
use clap::Parser;
use rgw_core::config::Config;
use rgw_core::types::{Host, ServiceAttrs};
use rgw_dispatch::PacketDispatcher;
use rgw_dns::DnsFrontend;
use rgw_engine::{Engine, Policy};
use rgw_pool::CircularPool;
use rgw_registry::HostRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "rgw", about = "Realm Gateway - DNS-triggered NAT/address-translation gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/rgw/rgw.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;

    init_logging(&config.logging);
    info!(instance_id = %config.instance.id, "starting rgw");

    let engine = Arc::new(Mutex::new(build_engine(&config)?));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let frontend = Arc::new(DnsFrontend::new(&config, engine.clone())?);
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = frontend.run(rx).await {
            error!("DNS frontend error: {e}");
        }
    }));

    // The packet dispatcher's kernel-queue integration (enqueue-hook registration
    // against a real NFQUEUE or equivalent) is out of scope (§1); `PacketDispatcher`
    // is built here and ready to be driven once that integration exists.
    let _dispatcher = PacketDispatcher::new(engine.clone());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping services...");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }

    info!("rgw stopped");
    Ok(())
}

fn build_engine(config: &Config) -> Result<Engine> {
    let mut registry = HostRegistry::new();
    for host_cfg in &config.hosts {
        let mut host = Host::new(&host_cfg.fqdn, host_cfg.ipv4, host_cfg.circularpool_max)
            .with_carriergrade_whitelist(host_cfg.carriergrade_whitelist.clone());
        for svc_cfg in &host_cfg.services {
            host = host.with_service(&svc_cfg.sfqdn, service_attrs(svc_cfg));
        }
        registry.provision(host)?;

        // A carrier-grade service also answers for any name under its own SFQDN,
        // not only the exact name (§4.4 step 6, §9 carrier-grade-FQDN indexing).
        for svc_cfg in &host_cfg.services {
            if svc_cfg.carriergrade {
                registry.set_carriergrade_domain(&host_cfg.fqdn, &svc_cfg.sfqdn, service_attrs(svc_cfg))?;
            }
        }
    }

    let pool = CircularPool::new(config.pools.circularpool.clone());
    let service_pool = CircularPool::new(config.pools.servicepool.clone());
    let policy = Policy { global_max: config.policy.circularpool_max };
    Ok(Engine::new(registry, pool, service_pool, policy))
}

fn service_attrs(svc_cfg: &rgw_core::config::ServiceConfig) -> ServiceAttrs {
    ServiceAttrs {
        port: svc_cfg.port,
        protocol: svc_cfg.protocol,
        proxy_required: svc_cfg.proxy_required,
        carriergrade: svc_cfg.carriergrade,
        loose_packet: svc_cfg.loose_packet,
        autobind: svc_cfg.autobind,
        timeout: Duration::from_secs_f64(svc_cfg.timeout_secs),
    }
}

fn init_logging(config: &rgw_core::config::LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
